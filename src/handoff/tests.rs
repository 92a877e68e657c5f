// SPDX-License-Identifier: MPL-2.0

//! Scenario and stress tests for the frame handoff.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    Arc, Mutex, mpsc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::event_loop::{CalloopScheduler, testing::ManualLoop};
use crate::format::ByteOrder;
use crate::sink::{
    FrameView,
    testing::{Recorder, RecordingSink},
};

fn controller(
    event_loop: ManualLoop,
    recorder: &Recorder,
    width: u32,
    height: u32,
) -> HandoffController<RecordingSink, ManualLoop> {
    HandoffController::new(
        FrameSlot::allocate(width, height).unwrap(),
        recorder.sink(),
        event_loop,
        Duration::from_millis(10),
    )
}

/// A frame whose every 4-byte word holds `index`.
fn numbered_frame(index: u32, width: u32, height: u32) -> Vec<u8> {
    let len = (width * height * 3) as usize;
    index.to_le_bytes().into_iter().cycle().take(len).collect()
}

/// The index of a frame built by [`numbered_frame`], or `None` if it is torn.
fn frame_index(data: &[u8]) -> Option<u32> {
    let mut words = data.chunks_exact(4);
    let first = words.next()?;
    words.all(|w| w == first).then(|| u32::from_le_bytes(first.try_into().unwrap()))
}

#[test]
fn test_single_frame_round_trip() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    let pixels: Vec<u8> = (0..24).collect();
    assert_eq!(controller.produce(&pixels, 4, 2).unwrap(), Handoff::Scheduled);
    assert_eq!(controller.state(), HandoffState::Scheduled);
    assert_eq!(controller.in_flight(), 1);
    assert!(recorder.uploads().is_empty());

    assert_eq!(event_loop.run_pending(), 1);

    let uploads = recorder.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].data, pixels);
    assert_eq!((uploads[0].width, uploads[0].height), (4, 2));
    assert_eq!(uploads[0].stride, 12);
    assert_eq!(uploads[0].bytes_per_pixel, 3);
    assert_eq!(uploads[0].byte_order, ByteOrder::Bgr);
    assert_eq!(controller.state(), HandoffState::Idle);
    assert_eq!(controller.in_flight(), 0);
}

#[test]
fn test_back_to_back_delivers_only_second() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    let first = vec![1u8; 24];
    let second = vec![2u8; 24];
    assert_eq!(controller.produce(&first, 4, 2).unwrap(), Handoff::Scheduled);
    assert_eq!(controller.produce(&second, 4, 2).unwrap(), Handoff::Replaced);
    assert_eq!(controller.in_flight(), 1);
    assert_eq!(event_loop.pending(), 1);

    assert_eq!(event_loop.run_pending(), 1);

    let uploads = recorder.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].data, second);

    let stats = controller.stats();
    assert_eq!(stats.frames_scheduled, 2);
    assert_eq!(stats.frames_replaced, 1);
    assert_eq!(stats.frames_delivered, 1);
}

#[test]
fn test_without_cancel_second_frame_is_dropped() {
    let event_loop = ManualLoop::without_cancel();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    let first = vec![1u8; 24];
    let second = vec![2u8; 24];
    assert_eq!(controller.produce(&first, 4, 2).unwrap(), Handoff::Scheduled);
    assert_eq!(controller.produce(&second, 4, 2).unwrap(), Handoff::Dropped);
    assert_eq!(event_loop.run_pending(), 1);

    let uploads = recorder.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].data, first);
    assert_eq!(controller.stats().frames_dropped, 1);

    // The slot is free again once the task has run.
    assert_eq!(controller.produce(&second, 4, 2).unwrap(), Handoff::Scheduled);
    assert_eq!(event_loop.run_pending(), 1);
    assert_eq!(recorder.uploads()[1].data, second);
}

#[test]
fn test_frame_dropped_while_task_running() {
    struct GatedSink {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl TextureSink for GatedSink {
        fn upload(&mut self, frame: FrameView<'_>) -> eyre::Result<()> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.frames.lock().unwrap().push(frame.data.to_vec());
            Ok(())
        }
    }

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let event_loop = ManualLoop::new();
    let mut controller = HandoffController::new(
        FrameSlot::allocate(2, 2).unwrap(),
        GatedSink {
            entered: entered_tx,
            release: release_rx,
            frames: Arc::clone(&frames),
        },
        event_loop.clone(),
        Duration::from_millis(10),
    );

    assert_eq!(controller.produce(&[1; 12], 2, 2).unwrap(), Handoff::Scheduled);

    let runner = {
        let event_loop = event_loop.clone();
        thread::spawn(move || event_loop.run_pending())
    };
    entered_rx.recv().unwrap();

    // The task owns the slot: the new frame can neither cancel it nor overwrite it.
    assert_eq!(controller.state(), HandoffState::Scheduled);
    assert_eq!(controller.produce(&[2; 12], 2, 2).unwrap(), Handoff::Dropped);
    assert_eq!(controller.in_flight(), 1);

    release_tx.send(()).unwrap();
    assert_eq!(runner.join().unwrap(), 1);
    assert_eq!(controller.state(), HandoffState::Idle);

    assert_eq!(controller.produce(&[3; 12], 2, 2).unwrap(), Handoff::Scheduled);
    release_tx.send(()).unwrap();
    assert_eq!(event_loop.run_pending(), 1);

    assert_eq!(*frames.lock().unwrap(), vec![vec![1; 12], vec![3; 12]]);
}

#[test]
fn test_frame_size_mismatch_changes_nothing() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    assert!(matches!(
        controller.produce(&[0; 23], 4, 2),
        Err(BridgeError::FrameSize { len: 23, .. })
    ));
    assert!(controller.produce(&[0; 24], 2, 4).is_err());
    assert_eq!(controller.state(), HandoffState::Idle);
    assert_eq!(event_loop.pending(), 0);

    // A pending frame is not cancelled by a bad one.
    assert_eq!(controller.produce(&[7; 24], 4, 2).unwrap(), Handoff::Scheduled);
    assert!(controller.produce(&[8; 25], 4, 2).is_err());
    assert_eq!(event_loop.run_pending(), 1);
    assert_eq!(recorder.uploads()[0].data, vec![7; 24]);
}

#[test]
fn test_shutdown_cancels_queued_task() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);
    let probe = controller.probe();

    assert_eq!(controller.produce(&[5; 24], 4, 2).unwrap(), Handoff::Scheduled);
    let stats = controller.shutdown();

    assert_eq!(stats.frames_scheduled, 1);
    assert_eq!(stats.frames_delivered, 0);
    assert_eq!(recorder.released(), 1);
    assert_eq!(event_loop.pending(), 0);
    assert_eq!(probe.state(), HandoffState::Destroyed);
    assert_eq!(probe.in_flight(), 0);

    // The cancelled task is still queued but must not touch the released slot.
    assert_eq!(event_loop.run_pending(), 0);
    assert!(recorder.uploads().is_empty());
}

#[test]
fn test_shutdown_waits_for_loop_that_cannot_cancel() {
    let event_loop = ManualLoop::without_cancel();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    assert_eq!(controller.produce(&[9; 24], 4, 2).unwrap(), Handoff::Scheduled);

    let runner = {
        let event_loop = event_loop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            event_loop.run_pending()
        })
    };

    let started = Instant::now();
    let stats = controller.shutdown();

    // The task ran to completion before the buffer went away.
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(stats.frames_delivered, 1);
    assert_eq!(recorder.uploads()[0].data, vec![9; 24]);
    assert_eq!(recorder.released(), 1);
    assert_eq!(runner.join().unwrap(), 1);
}

#[test]
fn test_shutdown_idle_releases_once() {
    let recorder = Recorder::default();
    let controller = controller(ManualLoop::new(), &recorder, 4, 2);

    let stats = controller.shutdown();
    assert_eq!(stats, HandoffStats::default());
    assert_eq!(recorder.released(), 1);
}

#[test]
fn test_buffer_freed_before_shutdown_returns() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);
    assert_eq!(controller.produce(&[3; 24], 4, 2).unwrap(), Handoff::Scheduled);

    let shared = Arc::clone(&controller.shared);
    controller.shutdown();

    // SAFETY: the controller is destroyed; nothing else reaches the resources.
    assert!(unsafe { (*shared.resources.get()).is_none() });
    assert_eq!(recorder.released(), 1);
    // The cancelled task still holds its reference until the loop discards it.
    assert_eq!(event_loop.run_pending(), 0);
    assert_eq!(Arc::strong_count(&shared), 1);
}

#[test]
fn test_drop_without_shutdown_quiesces() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let probe = {
        let mut controller = controller(event_loop.clone(), &recorder, 4, 2);
        assert_eq!(controller.produce(&[1; 24], 4, 2).unwrap(), Handoff::Scheduled);
        controller.probe()
    };

    assert_eq!(probe.state(), HandoffState::Destroyed);
    assert_eq!(recorder.released(), 1);
    assert_eq!(event_loop.run_pending(), 0);
}

#[test]
fn test_failed_upload_returns_to_idle() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    recorder.fail.store(true, Ordering::SeqCst);
    assert_eq!(controller.produce(&[1; 24], 4, 2).unwrap(), Handoff::Scheduled);
    assert_eq!(event_loop.run_pending(), 1);

    assert_eq!(controller.state(), HandoffState::Idle);
    assert_eq!(controller.stats().uploads_failed, 1);
    assert_eq!(controller.stats().frames_delivered, 0);

    recorder.fail.store(false, Ordering::SeqCst);
    assert_eq!(controller.produce(&[2; 24], 4, 2).unwrap(), Handoff::Scheduled);
    assert_eq!(event_loop.run_pending(), 1);
    assert_eq!(recorder.uploads()[0].data, vec![2; 24]);
}

#[test]
fn test_panicking_upload_returns_to_idle() {
    let event_loop = ManualLoop::new();
    let recorder = Recorder::default();
    let mut controller = controller(event_loop.clone(), &recorder, 4, 2);

    recorder.panic.store(true, Ordering::SeqCst);
    assert_eq!(controller.produce(&[1; 24], 4, 2).unwrap(), Handoff::Scheduled);
    let result = panic::catch_unwind(AssertUnwindSafe(|| event_loop.run_pending()));
    assert!(result.is_err());

    assert_eq!(controller.state(), HandoffState::Idle);
    assert_eq!(controller.in_flight(), 0);

    recorder.panic.store(false, Ordering::SeqCst);
    let stats = controller.shutdown();
    assert_eq!(stats.frames_scheduled, 1);
    assert_eq!(recorder.released(), 1);
}

fn spawn_calloop() -> (CalloopScheduler, calloop::LoopSignal, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let mut event_loop = calloop::EventLoop::<()>::try_new().unwrap();
        let (scheduler, _token) = CalloopScheduler::register(&event_loop.handle()).unwrap();
        tx.send((scheduler, event_loop.get_signal())).unwrap();
        event_loop
            .run(Duration::from_millis(5), &mut (), |_| {})
            .unwrap();
    });
    let (scheduler, signal) = rx.recv().unwrap();
    (scheduler, signal, join)
}

#[test]
fn test_concurrent_handoff_never_tears_or_overlaps() {
    const FRAMES: u32 = 4000;
    const WIDTH: u32 = 16;
    const HEIGHT: u32 = 8;

    let (scheduler, signal, loop_thread) = spawn_calloop();
    let recorder = Recorder::default();
    let mut controller = HandoffController::new(
        FrameSlot::allocate(WIDTH, HEIGHT).unwrap(),
        recorder.sink(),
        scheduler,
        Duration::from_millis(50),
    );
    let probe = controller.probe();

    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let probe = probe.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut max = 0;
            while !done.load(Ordering::SeqCst) {
                max = max.max(probe.in_flight());
                thread::yield_now();
            }
            max
        })
    };

    let mut dropped = HashSet::new();
    for index in 0..FRAMES {
        let frame = numbered_frame(index, WIDTH, HEIGHT);
        if controller.produce(&frame, WIDTH, HEIGHT).unwrap() == Handoff::Dropped {
            dropped.insert(index);
        }
        if index % 97 == 0 {
            thread::sleep(Duration::from_micros(200));
        }
    }

    let stats = controller.shutdown();
    done.store(true, Ordering::SeqCst);
    let max_in_flight = sampler.join().unwrap();
    signal.stop();
    signal.wakeup();
    loop_thread.join().unwrap();

    assert!(max_in_flight <= 1, "observed {max_in_flight} tasks in flight");
    assert_eq!(recorder.released(), 1);
    assert_eq!(probe.state(), HandoffState::Destroyed);
    assert_eq!(probe.in_flight(), 0);

    let uploads = recorder.uploads();
    assert_eq!(uploads.len() as u64, stats.frames_delivered);
    assert!(stats.frames_delivered > 0);

    let mut last = None;
    for upload in &uploads {
        let index = frame_index(&upload.data).expect("torn frame delivered");
        assert!(!dropped.contains(&index), "dropped frame {index} was delivered");
        if let Some(previous) = last {
            assert!(index > previous, "frame {index} delivered after {previous}");
        }
        last = Some(index);
    }

    assert_eq!(
        stats.frames_scheduled + stats.frames_dropped,
        u64::from(FRAMES)
    );
    assert_eq!(stats.frames_dropped, dropped.len() as u64);
    assert!(stats.frames_delivered + stats.frames_replaced <= stats.frames_scheduled);
    assert!(stats.frames_scheduled <= stats.frames_delivered + stats.frames_replaced + 1);
}
