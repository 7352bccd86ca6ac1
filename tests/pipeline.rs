use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use streamy::audio_output::{AudioSink, NullAudioOutput};
use streamy::playback::{PlaybackStats, PlaybackWorker};
use streamy::queue::{Command, CommandQueue};
use streamy::telemetry::QUEUE_TOPIC;
use streamy::testing::{RecordingBroker, RecordingSink, SinkEvent};
use streamy::{AudioFormat, LinkState, PinConfig, Scope, StreamController, StreamSettings};

const WAIT: Duration = Duration::from_secs(2);

fn start(sink: &RecordingSink, settings: StreamSettings) -> (StreamController, RecordingBroker, LinkState) {
    let broker = RecordingBroker::new();
    let link = LinkState::new();
    let controller = StreamController::init(
        AudioFormat::default(),
        settings,
        sink.clone(),
        Arc::new(broker.clone()),
        link.clone(),
    )
    .unwrap();
    (controller, broker, link)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn chunk_size_is_computed_from_format() {
    let format = AudioFormat::new(PinConfig::default(), 44_100, 16, 10, 3).unwrap();
    assert_eq!(format.chunk_bytes(), 882);
}

#[test]
fn writes_reach_sink_in_order_byte_for_byte() {
    let sink = RecordingSink::new();
    let (controller, _, _) = start(&sink, StreamSettings::default());

    let chunks: Vec<Vec<u8>> = (0u8..40).map(|i| vec![i; 1 + usize::from(i) * 7]).collect();
    for chunk in &chunks {
        controller.write(chunk).unwrap();
    }
    controller.shutdown();

    let expected: Vec<SinkEvent> = std::iter::once(SinkEvent::Flush)
        .chain(chunks.iter().cloned().map(SinkEvent::Write))
        .collect();
    assert_eq!(sink.events(), expected);
}

#[test]
fn concurrent_producers_never_interleave_chunks() {
    let sink = RecordingSink::new();
    let (controller, _, _) = start(
        &sink,
        StreamSettings {
            queue_capacity: 2,
            ..StreamSettings::default()
        },
    );
    let controller = Arc::new(controller);

    let producers: Vec<_> = (0u8..4)
        .map(|id| {
            let controller = controller.clone();
            thread::spawn(move || {
                for seq in 0u8..10 {
                    controller.write(&[id, seq, id, seq]).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    controller.shutdown();

    let writes: Vec<Vec<u8>> = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            SinkEvent::Write(pcm) => Some(pcm),
            SinkEvent::Flush => None,
        })
        .collect();
    assert_eq!(writes.len(), 40);
    for id in 0u8..4 {
        let seqs: Vec<u8> = writes
            .iter()
            .filter(|pcm| pcm[0] == id)
            .map(|pcm| {
                assert_eq!(pcm[2], id);
                assert_eq!(pcm[1], pcm[3]);
                pcm[1]
            })
            .collect();
        assert_eq!(seqs, (0u8..10).collect::<Vec<_>>());
    }
}

#[test]
fn stop_between_writes_flushes_without_touching_them() {
    let sink = RecordingSink::new();
    let (controller, _, _) = start(&sink, StreamSettings::default());

    controller.write(b"aaaa").unwrap();
    controller.stop().unwrap();
    controller.write(b"bbbb").unwrap();
    controller.shutdown();

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Flush,
            SinkEvent::Write(b"aaaa".to_vec()),
            SinkEvent::Flush,
            SinkEvent::Write(b"bbbb".to_vec()),
        ]
    );
}

#[test]
fn full_queue_blocks_producer_until_worker_pops() {
    let (queue, commands) = CommandQueue::bounded(2);
    queue.push(Command::Write(b"aaaa".to_vec())).unwrap();
    queue.push(Command::Write(b"bbbb".to_vec())).unwrap();

    let pushed = Arc::new(AtomicBool::new(false));
    let producer = {
        let queue = queue.clone();
        let pushed = pushed.clone();
        thread::spawn(move || {
            queue.push(Command::Write(b"cccc".to_vec())).unwrap();
            pushed.store(true, Ordering::Release);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!pushed.load(Ordering::Acquire), "push into a full queue returned early");

    let mut sink = RecordingSink::new();
    sink.configure(&AudioFormat::default()).unwrap();
    let worker = PlaybackWorker::new(
        sink.clone(),
        commands,
        Arc::new(PlaybackStats::default()),
        Arc::new(AtomicBool::new(false)),
    )
    .spawn()
    .unwrap();

    producer.join().unwrap();
    assert!(pushed.load(Ordering::Acquire));
    drop(queue);
    worker.join().unwrap();

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Write(b"aaaa".to_vec()),
            SinkEvent::Write(b"bbbb".to_vec()),
            SinkEvent::Write(b"cccc".to_vec()),
        ]
    );
}

#[test]
fn held_sink_backpressures_controller_writes() {
    let sink = RecordingSink::new();
    sink.hold();
    let (controller, _, _) = start(
        &sink,
        StreamSettings {
            queue_capacity: 2,
            ..StreamSettings::default()
        },
    );
    let controller = Arc::new(controller);

    // The worker takes the first chunk and stalls inside the sink.
    controller.write(b"0000").unwrap();
    assert!(sink.wait_for_writes_entered(1, WAIT));
    controller.write(b"aaaa").unwrap();
    controller.write(b"bbbb").unwrap();
    assert_eq!(controller.depth(), 2);

    let (done_tx, done_rx) = mpsc::channel();
    let producer = {
        let controller = controller.clone();
        thread::spawn(move || {
            controller.write(b"cccc").unwrap();
            done_tx.send(()).unwrap();
        })
    };
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    sink.release();
    done_rx.recv_timeout(WAIT).unwrap();
    producer.join().unwrap();
    controller.shutdown();

    assert_eq!(sink.written_bytes(), b"0000aaaabbbbcccc".to_vec());
}

#[test]
fn telemetry_reports_depth_only_while_connected() {
    let sink = RecordingSink::new();
    sink.hold();
    let (controller, broker, link) = start(
        &sink,
        StreamSettings {
            queue_capacity: 3,
            update_interval: Duration::from_millis(10),
            ..StreamSettings::default()
        },
    );

    controller.write(b"held").unwrap();
    assert!(sink.wait_for_writes_entered(1, WAIT));
    controller.write(b"aaaa").unwrap();
    controller.write(b"bbbb").unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(broker.published().is_empty());

    link.set_connected(true);
    assert!(wait_until(|| broker.published().len() >= 3));

    let samples = broker.published();
    for sample in &samples {
        assert_eq!(sample.topic, QUEUE_TOPIC);
        assert_eq!(sample.scope, Scope::Local);
        assert!(!sample.retain);
        assert!((0..=3).contains(&sample.value));
    }
    assert_eq!(samples.last().map(|s| s.value), Some(2));

    link.set_connected(false);
    sink.release();
    controller.shutdown();
}

#[test]
fn message_routing_ignores_foreign_topics_and_scopes() {
    let sink = RecordingSink::new();
    let (controller, _, _) = start(
        &sink,
        StreamSettings {
            namespace: "speaker".to_string(),
            ..StreamSettings::default()
        },
    );

    controller.handle("speaker/write", b"good", Scope::Local);
    controller.handle("speaker/write", b"relayed", Scope::Global);
    controller.handle("write", b"bare", Scope::Local);
    controller.handle("speaker/volume", b"11", Scope::Local);
    controller.handle("speaker/stop", b"", Scope::Local);
    controller.shutdown();

    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Flush,
            SinkEvent::Write(b"good".to_vec()),
            SinkEvent::Flush,
        ]
    );
}

#[test]
fn null_output_plays_in_real_time() {
    // 8 kHz / 8 bit: 8000 bytes per second, 160 byte DMA ring.
    let format = AudioFormat::new(PinConfig::default(), 8_000, 8, 10, 2).unwrap();
    let controller = StreamController::init(
        format,
        StreamSettings::default(),
        NullAudioOutput::new(),
        Arc::new(RecordingBroker::new()),
        LinkState::new(),
    )
    .unwrap();

    let started = Instant::now();
    for _ in 0..4 {
        controller.write(&[128; 400]).unwrap();
    }
    controller.shutdown();

    // 1600 bytes is 200 ms of audio, of which only the ring's 20 ms may be absorbed.
    assert!(started.elapsed() >= Duration::from_millis(170));
    assert_eq!(controller.stats().bytes(), 1600);
}
