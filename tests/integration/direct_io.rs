//! Buffer-level reads and writes through the direct scheduler.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use fibra::runtime::scheduler::TaskOutcome;
use fibra::runtime::{Descriptor, DirectScheduler, SchedulerError};
use parking_lot::Mutex;

fn socket_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    b.set_nonblocking(true).unwrap();
    (a, b)
}

#[test]
fn test_large_payload_round_trip() {
    let scheduler = Arc::new(DirectScheduler::new());
    let (writer, reader) = socket_pair();
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

    let sched = scheduler.clone();
    let outgoing = payload.clone();
    let write_task = scheduler
        .spawn(move || {
            let descriptor = Descriptor::of(&writer);
            let written = sched.io_write(descriptor, &outgoing, outgoing.len(), None)?;
            anyhow::ensure!(written == outgoing.len(), "short write: {}", written);
            drop(writer);
            Ok(())
        })
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sched = scheduler.clone();
    let sink = received.clone();
    let read_task = scheduler
        .spawn(move || {
            let descriptor = Descriptor::of(&reader);
            let mut buffer = [0u8; 4096];
            loop {
                let n = sched.io_read(descriptor, &mut buffer, 0, None)?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock().extend_from_slice(&buffer[..n]);
            }
        })
        .unwrap();

    scheduler.close().unwrap();

    assert_eq!(write_task.outcome(), Some(TaskOutcome::Completed));
    assert_eq!(read_task.outcome(), Some(TaskOutcome::Completed));
    assert_eq!(*received.lock(), payload);
    assert_eq!(scheduler.waiting_len(), 0);
}

#[test]
fn test_read_waits_for_requested_length() {
    let scheduler = Arc::new(DirectScheduler::new());
    let (writer, reader) = socket_pair();

    let sched = scheduler.clone();
    scheduler
        .spawn(move || {
            let descriptor = Descriptor::of(&writer);
            sched.io_write(descriptor, b"abc", 0, None)?;
            sched.kernel_sleep(Some(Duration::from_millis(5)))?;
            sched.io_write(descriptor, b"def", 0, None)?;
            Ok(())
        })
        .unwrap();

    let result = Arc::new(Mutex::new(None));
    let sched = scheduler.clone();
    let slot = result.clone();
    scheduler
        .spawn(move || {
            let mut buffer = [0u8; 16];
            let n = sched.io_read(Descriptor::of(&reader), &mut buffer, 6, None)?;
            *slot.lock() = Some(buffer[..n].to_vec());
            Ok(())
        })
        .unwrap();

    scheduler.close().unwrap();

    assert_eq!(result.lock().as_deref(), Some(&b"abcdef"[..]));
}

#[test]
fn test_read_timeout_returns_partial_data() {
    let scheduler = Arc::new(DirectScheduler::new());
    let (mut writer, reader) = socket_pair();
    writer.write_all(b"abc").unwrap();

    let result = Arc::new(Mutex::new(None));
    let sched = scheduler.clone();
    let slot = result.clone();
    scheduler
        .spawn(move || {
            let mut buffer = [0u8; 16];
            let read = sched.io_read(
                Descriptor::of(&reader),
                &mut buffer,
                8,
                Some(Duration::from_millis(20)),
            );
            *slot.lock() = Some(read);
            Ok(())
        })
        .unwrap();

    scheduler.close().unwrap();

    assert!(matches!(result.lock().take(), Some(Ok(3))));
}

#[test]
fn test_read_timeout_without_data() {
    let scheduler = Arc::new(DirectScheduler::new());
    let (_writer, reader) = socket_pair();
    let timeout = Duration::from_millis(20);

    let result = Arc::new(Mutex::new(None));
    let sched = scheduler.clone();
    let slot = result.clone();
    scheduler
        .spawn(move || {
            let mut buffer = [0u8; 16];
            *slot.lock() = Some(sched.io_read(Descriptor::of(&reader), &mut buffer, 1, Some(timeout)));
            Ok(())
        })
        .unwrap();

    scheduler.close().unwrap();

    let got = result.lock().take();
    match got {
        Some(Err(SchedulerError::Timeout { timeout: reported, .. })) => assert_eq!(reported, timeout),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn test_read_at_end_of_stream() {
    let scheduler = Arc::new(DirectScheduler::new());
    let (writer, reader) = socket_pair();
    drop(writer);

    let result = Arc::new(Mutex::new(None));
    let sched = scheduler.clone();
    let slot = result.clone();
    scheduler
        .spawn(move || {
            let mut buffer = [0u8; 16];
            *slot.lock() = Some(sched.io_read(Descriptor::of(&reader), &mut buffer, 4, None)?);
            Ok(())
        })
        .unwrap();

    scheduler.close().unwrap();

    assert_eq!(*result.lock(), Some(0));
}

#[test]
fn test_write_to_closed_peer_fails() {
    let scheduler = Arc::new(DirectScheduler::new());
    let (writer, reader) = socket_pair();
    drop(reader);

    let result = Arc::new(Mutex::new(None));
    let sched = scheduler.clone();
    let slot = result.clone();
    scheduler
        .spawn(move || {
            *slot.lock() = Some(sched.io_write(Descriptor::of(&writer), b"lost", 4, None));
            Ok(())
        })
        .unwrap();

    scheduler.close().unwrap();

    assert!(matches!(
        result.lock().take(),
        Some(Err(SchedulerError::Selector { .. }))
    ));
    assert_eq!(scheduler.waiting_len(), 0);
}
