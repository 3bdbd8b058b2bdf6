//! Runtime callback implementations shared by the scenario, concurrency, and property tests.
//!
//! Mirrors `collective::mod`'s inline `Int32SumCallbacks` test fixture, split into two flavors:
//! a raw-byte identity datatype (broadcast/scatter/gather move opaque bytes, no reduction) and a
//! signed 32-bit sum datatype (reduce/all-reduce). `address_lookup` hands back the peer's rank as
//! a single byte, which `MockTransport::open_endpoint` decodes directly.

use ucg_core::callbacks::{FaultDisposition, IntegerKind, NativeDatatype, NativeReduceOp, NeighborTopology, ReduceOpKind, RuntimeCallbacks};
use ucg_core::error::CoreError;

/// Datatype 0: an opaque byte with no reduction semantics, used by broadcast/scatter/gather
/// scenarios that only move data, never combine it.
pub struct ByteCallbacks;

impl RuntimeCallbacks for ByteCallbacks {
    fn address_lookup(&self, _group_id: u32, member_index: u32) -> Result<Vec<u8>, CoreError> {
        Ok(vec![member_index as u8])
    }

    fn neighbor_topology(&self, _group_id: u32) -> NeighborTopology {
        NeighborTopology::default()
    }

    fn datatype_convert(&self, external: u64) -> NativeDatatype {
        external
    }

    fn datatype_span(&self, _dt: NativeDatatype, count: usize) -> (usize, usize) {
        (count, 0)
    }

    fn datatype_is_contiguous(&self, _dt: NativeDatatype) -> bool {
        true
    }

    fn datatype_element_size(&self, _dt: NativeDatatype) -> usize {
        1
    }

    fn datatype_is_integer(&self, _dt: NativeDatatype) -> IntegerKind {
        IntegerKind {
            is_integer: true,
            is_signed: false,
        }
    }

    fn datatype_is_floating_point(&self, _dt: NativeDatatype) -> bool {
        false
    }

    fn reduce_apply(&self, _op: NativeReduceOp, _src: &[u8], _dst: &mut [u8], _count: usize, _dt: NativeDatatype) {}

    fn reduce_op_kind(&self, _op: NativeReduceOp) -> ReduceOpKind {
        ReduceOpKind {
            is_sum: false,
            is_commutative: true,
            is_loc_expected: false,
        }
    }

    fn fault_handle(&self, _error: &CoreError) -> FaultDisposition {
        FaultDisposition::Unhandled
    }
}

/// Datatype 0: a 4-byte signed integer with a commutative sum operator, used by the reduce and
/// all-reduce scenarios. Identical to `collective::mod`'s `Int32SumCallbacks` test fixture.
pub struct Int32SumCallbacks;

impl RuntimeCallbacks for Int32SumCallbacks {
    fn address_lookup(&self, _group_id: u32, member_index: u32) -> Result<Vec<u8>, CoreError> {
        Ok(vec![member_index as u8])
    }

    fn neighbor_topology(&self, _group_id: u32) -> NeighborTopology {
        NeighborTopology::default()
    }

    fn datatype_convert(&self, external: u64) -> NativeDatatype {
        external
    }

    fn datatype_span(&self, _dt: NativeDatatype, count: usize) -> (usize, usize) {
        (count * 4, 4)
    }

    fn datatype_is_contiguous(&self, _dt: NativeDatatype) -> bool {
        true
    }

    fn datatype_element_size(&self, _dt: NativeDatatype) -> usize {
        4
    }

    fn datatype_is_integer(&self, _dt: NativeDatatype) -> IntegerKind {
        IntegerKind {
            is_integer: true,
            is_signed: true,
        }
    }

    fn datatype_is_floating_point(&self, _dt: NativeDatatype) -> bool {
        false
    }

    fn reduce_apply(&self, _op: NativeReduceOp, _src: &[u8], _dst: &mut [u8], _count: usize, _dt: NativeDatatype) {}

    fn reduce_op_kind(&self, _op: NativeReduceOp) -> ReduceOpKind {
        ReduceOpKind {
            is_sum: true,
            is_commutative: true,
            is_loc_expected: false,
        }
    }

    fn fault_handle(&self, _error: &CoreError) -> FaultDisposition {
        FaultDisposition::Unhandled
    }
}
