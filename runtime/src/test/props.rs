//! Property tests for the ABI contracts.

use molten_dtype::DType;
use proptest::collection::vec;
use proptest::prelude::*;

use crate::arguments::{Argument, MemrefDesc};
use crate::results::verify_entrypoint_signature;
use crate::types::{FunctionType, Type};

fn memref_type(sizes: &[i64]) -> Type {
    Type::Memref { dtype: DType::Float32, sizes: sizes.iter().map(|s| Some(*s)).collect() }
}

proptest! {
    /// Packing writes exactly the declared number of slots, at the declared
    /// offset, and touches nothing else.
    #[test]
    fn prop_pack_conserves_abi_slots(
        sizes in vec(1i64..16, 0..4),
        prefix in 0usize..4,
        suffix in 0usize..4,
    ) {
        let arg = Argument::from(MemrefDesc::contiguous(
            DType::Float32,
            std::ptr::dangling_mut::<f32>() as *mut (),
            &sizes,
        ));
        let slots = memref_type(&sizes).as_argument().unwrap().num_slots;
        prop_assert_eq!(slots, 3 + 2 * sizes.len());

        let mut buffer = vec![std::ptr::null_mut(); prefix + slots + suffix];
        let next = arg.pack(&mut buffer, prefix);

        prop_assert_eq!(next, prefix + slots);
        prop_assert!(buffer[..prefix].iter().all(|p| p.is_null()));
        prop_assert!(buffer[prefix..next].iter().all(|p| !p.is_null()));
        prop_assert!(buffer[next..].iter().all(|p| p.is_null()));
    }

    /// The results layout is total and tightly packed in declaration order.
    #[test]
    fn prop_results_layout_totality(
        memref_ranks in vec(0usize..4, 0..4),
        async_results in vec(any::<bool>(), 0..4),
    ) {
        let mut results = Vec::new();
        for rank in &memref_ranks {
            results.push(memref_type(&vec![2; *rank]));
        }
        for token in &async_results {
            if *token {
                results.push(Type::AsyncToken);
            } else {
                results.push(Type::AsyncValue(Box::new(memref_type(&[4]))));
            }
        }

        let signature = FunctionType::new(vec![], results.clone());
        let layout = verify_entrypoint_signature(&signature).unwrap();

        prop_assert_eq!(layout.offsets.len(), results.len());
        prop_assert_eq!(layout.has_async_results, !async_results.is_empty());

        // Tightly packed: each offset is the previous offset plus the
        // previous result's size, and the sizes sum to the total.
        let mut expected_offset = 0usize;
        for (ty, offset) in results.iter().zip(&layout.offsets) {
            prop_assert_eq!(*offset, expected_offset);
            expected_offset += ty.as_result().unwrap().size_bytes;
        }
        prop_assert_eq!(layout.size_bytes, expected_offset);
        prop_assert!(layout.offsets.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
