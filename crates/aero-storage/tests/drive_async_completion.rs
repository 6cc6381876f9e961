use aero_storage::{Completion, DeferredBackend, Drive, MemBackend};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn sync_backend_completes_without_invoking_callback() {
    let mut backend = MemBackend::new(4096);
    backend.write_at(0, &[0xAAu8; 512]).ok();
    let mut drive = Drive::new(Box::new(aero_storage::SyncDiskBackend::new(backend)));

    let invoked = Rc::new(RefCell::new(false));
    let invoked_cb = invoked.clone();
    let completion = drive.read(
        512,
        0,
        Box::new(move |_| {
            *invoked_cb.borrow_mut() = true;
        }),
    );
    match completion {
        Completion::Sync(Ok(data)) => assert_eq!(data, vec![0xAAu8; 512]),
        _ => panic!("expected synchronous completion"),
    }
    assert!(!*invoked.borrow(), "sync completion must not invoke the callback");
    assert!(!drive.is_busy());
}

#[test]
fn deferred_backend_completes_exactly_once_later() {
    let disk = MemBackend::new(4096);
    let mut drive = Drive::new(Box::new(DeferredBackend::new(disk)));

    let result = Rc::new(RefCell::new(None));
    let result_cb = result.clone();
    let completion = drive.write(
        vec![0x42u8; 512],
        0,
        Box::new(move |r| {
            *result_cb.borrow_mut() = Some(r);
        }),
    );
    assert!(matches!(completion, Completion::Async));
    assert!(drive.is_busy(), "one request must be in flight");
    assert!(result.borrow().is_none(), "callback must not have fired yet");

    drive.check_complete();
    assert!(result.borrow().as_ref().unwrap().is_ok());
}

#[test]
fn cancel_transfers_prevents_the_callback_from_ever_firing() {
    let disk = MemBackend::new(4096);
    let mut drive = Drive::new(Box::new(DeferredBackend::new(disk)));

    let invoked = Rc::new(RefCell::new(false));
    let invoked_cb = invoked.clone();
    drive.write(
        vec![0u8; 512],
        0,
        Box::new(move |_| {
            *invoked_cb.borrow_mut() = true;
        }),
    );
    drive.cancel_transfers();
    drive.check_complete();
    assert!(!*invoked.borrow());
    assert!(!drive.is_busy());
}
