#![no_main]

use libfuzzer_sys::fuzz_target;
use simtc_ir::{Function, TypeContext};
use simtc_opt::StackAllocator;

// Each pair of bytes is one operation: allocate when the first byte is even,
// otherwise free a live allocation picked by the second byte.
fuzz_target!(|data: &[u8]| {
    let mut types = TypeContext::new();
    let ty = types.index();
    let mut func = Function::new("fuzz");
    let mut stack = StackAllocator::new();

    for op in data.chunks_exact(2) {
        let (kind, arg) = (op[0], op[1]);
        if kind % 2 == 0 || stack.live().is_empty() {
            let size = i64::from(arg) + 1;
            let align = 1i64 << (kind % 8);
            let value = func.new_value(ty, None);
            let offset = stack.allocate(value, size, align);
            assert_eq!(offset % align, 0, "misaligned allocation");
        } else {
            let victim = stack.live()[usize::from(arg) % stack.live().len()].value;
            stack.free(victim).expect("live allocation must be freeable");
        }

        let live = stack.live();
        for pair in live.windows(2) {
            assert!(pair[0].stop <= pair[1].start, "overlapping allocations");
        }
        if let Some(last) = live.last() {
            assert!(last.stop <= stack.high_water_mark());
        }
    }
});
