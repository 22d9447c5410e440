//! Arena behavior across independent mappings of the same segment.
//!
//! Each `Arena` value below is its own mapping, so these exercise the same
//! paths two cooperating processes would.

use std::sync::atomic::{AtomicU32, Ordering};

use weir_shm::{Arena, ArenaError, MAX_NAMED_OBJECTS, MIN_ARENA_SIZE};

fn unique(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "weir-test-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[test]
fn create_then_open() {
    let name = unique("open");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    let b = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    assert_eq!(a.capacity(), b.capacity());
    drop(a);
    // b still attached; the segment must survive a's detach.
    assert!(b.find("nothing").is_none());
}

#[test]
fn open_existing_requires_existence() {
    let name = unique("missing");
    match Arena::open_existing(&name) {
        Err(ArenaError::NotFound { .. }) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn construct_is_visible_in_other_mapping() {
    let name = unique("construct");
    let writer = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    let reader = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();

    let handle = writer
        .construct("answer", 8, 8, |p| {
            // SAFETY: 8 bytes at 8-byte alignment were just allocated.
            unsafe { (p as *mut u64).write(42) }
        })
        .unwrap();

    let found = reader.find("answer").expect("object not found");
    assert_eq!(found, handle);
    let addr = reader.to_address(found).unwrap();
    // SAFETY: written above, immutable since.
    assert_eq!(unsafe { (addr as *const u64).read() }, 42);
}

#[test]
fn construct_rejects_duplicate_names() {
    let name = unique("dup");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    a.construct("obj", 16, 8, |_| {}).unwrap();
    match a.construct("obj", 16, 8, |_| {}) {
        Err(ArenaError::NameCollision { .. }) => {}
        other => panic!("expected NameCollision, got {other:?}"),
    }
}

#[test]
fn directory_fills_up() {
    let name = unique("full");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    for i in 0..MAX_NAMED_OBJECTS {
        a.construct(&format!("obj-{i}"), 8, 8, |_| {}).unwrap();
    }
    match a.construct("one-too-many", 8, 8, |_| {}) {
        Err(ArenaError::DirectoryFull { .. }) => {}
        other => panic!("expected DirectoryFull, got {other:?}"),
    }
}

#[test]
fn handle_roundtrip() {
    let name = unique("handle");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    let h = a.allocate(128, 64).unwrap();
    let addr = a.to_address(h).unwrap();
    assert_eq!(a.to_handle(addr), h);
    assert!(addr as usize % 64 == 0);
}

#[test]
fn bad_handles_are_rejected() {
    let name = unique("badhandle");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    assert!(matches!(
        a.to_address(weir_shm::Handle::NULL),
        Err(ArenaError::BadHandle { .. })
    ));
    assert!(matches!(
        a.to_address(weir_shm::Handle::from_offset(u64::MAX)),
        Err(ArenaError::BadHandle { .. })
    ));
}

#[test]
fn growth_is_observed_by_older_mapping() {
    let name = unique("grow");
    let early = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    let grower = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();

    grower.grow_to(1 << 20).unwrap();
    assert_eq!(grower.capacity(), 1 << 20);

    // Allocate past the original page; the early mapping must fault it in
    // on translation, not crash.
    let h = grower.allocate(512 * 1024, 64).unwrap();
    let from_grower = grower.to_address(h).unwrap();
    // SAFETY: freshly allocated and exclusively ours.
    unsafe { std::ptr::write_bytes(from_grower, 0xAB, 512 * 1024) };

    let from_early = early.to_address(h).unwrap();
    // SAFETY: same bytes through the other mapping.
    assert_eq!(unsafe { *from_early.add(512 * 1024 - 1) }, 0xAB);
}

#[test]
fn allocation_is_bounded_by_capacity() {
    let name = unique("bounded");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    match a.allocate(MIN_ARENA_SIZE * 2, 8) {
        Err(ArenaError::OutOfSpace { .. }) => {}
        other => panic!("expected OutOfSpace, got {other:?}"),
    }
}

#[test]
fn purge_removes_the_name() {
    let name = unique("purge");
    let a = Arena::open_or_create(&name, MIN_ARENA_SIZE).unwrap();
    assert!(Arena::purge(&name).unwrap());
    assert!(!Arena::purge(&name).unwrap());
    // Our mapping is still valid even though the name is gone.
    let h = a.allocate(8, 8).unwrap();
    assert!(a.to_address(h).is_ok());
    match Arena::open_existing(&name) {
        Err(ArenaError::NotFound { .. }) => {}
        other => panic!("expected NotFound after purge, got {other:?}"),
    }
}
