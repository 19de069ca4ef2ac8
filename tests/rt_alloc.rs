use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use lunahost::harness::RtHarness;
use lunahost::{BlockOutcome, HostConfig};

thread_local! {
    static ALLOC_COUNT: Cell<usize> = const { Cell::new(0) };
}

struct CountingAllocator;

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOC_COUNT.with(|c| c.set(c.get() + 1));
        unsafe { System.alloc(layout) }
    }
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static A: CountingAllocator = CountingAllocator;

fn allocations() -> usize {
    ALLOC_COUNT.with(Cell::get)
}

#[test]
fn rt_process_does_not_allocate() {
    let config = HostConfig::default().with_initial_code("echo\ncount\nchurn 512\ntrace tick");
    let mut h = RtHarness::new(config).unwrap();
    h.set_input(0, &[(0, 1), (17, 2), (40, 3)]);
    let mut notify = vec![0u8; 8192];

    let before = allocations();
    for i in 0..10_000u32 {
        let outcome = if i % 7 == 3 {
            h.run_block_contended(64)
        } else {
            h.run_block(64)
        };
        assert!(matches!(
            outcome,
            BlockOutcome::Processed { .. } | BlockOutcome::Stashed
        ));
        h.host.control_out(&mut notify, 64).unwrap();
    }
    let after = allocations();
    assert_eq!(after, before, "RT process should not allocate");
}

#[test]
fn rt_bypass_paths_do_not_allocate() {
    let config = HostConfig::default()
        .with_initial_region_size(4096)
        .with_max_regions(1)
        .with_initial_code("hold 8192");
    let mut h = RtHarness::new(config).unwrap();
    h.set_input(0, &[(5, 9)]);

    let before = allocations();
    for _ in 0..1_000 {
        assert!(matches!(h.run_block(64), BlockOutcome::Bypassed(_)));
    }
    assert_eq!(allocations(), before, "bypass should not allocate");
}
