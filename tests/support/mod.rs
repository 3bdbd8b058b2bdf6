pub mod callbacks;
pub mod driver;
pub mod mock_transport;
