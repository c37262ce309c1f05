//! End-to-end output scenarios driving a threaded port against test transports.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use enttec::message::decode;
use enttec::{
    Connector, DmxOutputPort, EnttecProPort, MemoryConnector, MessageLabel, OutputEvent,
    OutputOptions, Parameters, Result, Transport,
};

/// Shared record of what a test transport saw
#[derive(Default)]
struct WireLog {
    written: Mutex<Vec<Vec<u8>>>,
    attempts: AtomicUsize,
    released: AtomicBool,
    block_parameters: AtomicBool,
}

impl WireLog {
    fn labels(&self) -> Vec<MessageLabel> {
        self.written.lock().unwrap().iter().map(|f| decode(f).unwrap().label).collect()
    }
}

#[derive(Clone, Copy)]
enum Fault {
    None,
    EveryNth(usize),
    Slow(Duration),
}

struct FaultyTransport {
    wire: Arc<WireLog>,
    fault: Fault,
}

impl Transport for FaultyTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let attempt = self.wire.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        match self.fault {
            Fault::EveryNth(n) if attempt % n == 0 => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated write failure"));
            }
            Fault::Slow(delay) => thread::sleep(delay),
            _ => {}
        }

        let is_parameters = frame[1] == MessageLabel::SetParameters.as_u8();
        if is_parameters && self.wire.block_parameters.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "parameters rejected"));
        }

        self.wire.written.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn description(&self) -> String {
        "faulty".to_string()
    }
}

impl Drop for FaultyTransport {
    fn drop(&mut self) {
        self.wire.released.store(true, Ordering::SeqCst);
    }
}

struct FaultyConnector {
    wire: Arc<WireLog>,
    fault: Fault,
}

impl Connector for FaultyConnector {
    fn open(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(FaultyTransport {
            wire: Arc::clone(&self.wire),
            fault: self.fault,
        }))
    }

    fn describe(&self) -> String {
        "faulty port".to_string()
    }
}

fn faulty_port(params: Parameters, fault: Fault) -> (EnttecProPort, Arc<WireLog>) {
    let wire = Arc::new(WireLog::default());
    let connector = FaultyConnector {
        wire: Arc::clone(&wire),
        fault,
    };
    (EnttecProPort::with_options(connector, params, OutputOptions::default()), wire)
}

/// Poll `condition` until it holds or `timeout` elapses
fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_rendered_channels_reach_the_wire() {
    let connector = MemoryConnector::new();
    let mut port = EnttecProPort::with_options(
        connector.clone(),
        Parameters::new(9, 1, 40, 10).unwrap(),
        OutputOptions::default(),
    );

    let channels: Vec<i32> = (1..=10).collect();
    port.render_frame(&channels).unwrap();
    port.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || connector.frames().len() >= 3));
    port.stop();

    let mut expected = vec![0x7E, 6, 0x0B, 0x00, 0];
    expected.extend(1..=10u8);
    expected.push(0xE7);

    let frames = connector.frames();
    assert_eq!(decode(&frames[0]).unwrap().label, MessageLabel::SetParameters);
    assert!(frames[1..].iter().all(|f| f == &expected));
}

#[test]
fn test_parameters_payload_on_start() {
    let connector = MemoryConnector::new();
    let mut port = EnttecProPort::new(connector.clone());
    port.set_parameters(Parameters::new(24, 4, 40, 512).unwrap()).unwrap();

    port.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || connector.frames().len() >= 2));
    port.stop();

    let first = decode(&connector.frames()[0]).unwrap();
    assert_eq!(first.label, MessageLabel::SetParameters);
    assert_eq!(first.payload, vec![0x00, 0x02, 24, 4, 40]);

    let second = decode(&connector.frames()[1]).unwrap();
    assert_eq!(second.payload.len(), 513);
}

#[test]
fn test_long_dry_run_keeps_bounded_log() {
    let connector = MemoryConnector::with_capacity(4);
    let mut port = EnttecProPort::new(connector.clone());
    port.set_register_count(8).unwrap();
    port.start().unwrap();

    assert!(wait_for(Duration::from_secs(3), || connector.total_frames() >= 12));
    port.stop();

    let frames = connector.frames();
    assert_eq!(frames.len(), 4);
    assert!(connector.total_frames() >= 12);
    // The parameters went out first and have been evicted since
    assert!(connector.messages().iter().all(|m| m.label == MessageLabel::OutputOnlySendDmx));
}

#[test]
fn test_latest_render_wins() {
    let connector = MemoryConnector::new();
    let mut port = EnttecProPort::new(connector.clone());
    port.set_register_count(1).unwrap();
    port.start().unwrap();

    for value in 0..=200 {
        port.render_frame(&[value]).unwrap();
    }
    assert!(wait_for(Duration::from_secs(2), || {
        connector.messages().last().map(|m| m.payload.clone()) == Some(vec![0, 200])
    }));
    port.stop();
}

#[test]
fn test_loop_survives_every_third_write_failing() {
    let (mut port, wire) = faulty_port(Parameters::new(9, 1, 40, 16).unwrap(), Fault::EveryNth(3));
    let events = port.events();
    port.render_frame(&[255; 16]).unwrap();

    port.start().unwrap();
    assert!(wait_for(Duration::from_secs(3), || wire.attempts.load(Ordering::SeqCst) >= 12));
    assert!(port.is_started());

    // A parameter change lands while writes keep failing intermittently
    port.set_refresh_rate(30).unwrap();
    assert!(wait_for(Duration::from_secs(3), || !port.status().parameters_dirty));
    assert!(port.is_started());
    port.stop();

    let status = port.status();
    assert!(status.write_errors >= 4, "{:?}", status);
    assert!(status.frames_sent >= 7, "{:?}", status);
    assert_eq!(status.parameters.refresh_rate, 30);
    assert!(status.parameter_frames_sent >= 2);

    let collected: Vec<OutputEvent> = events.try_iter().collect();
    assert!(collected.iter().any(|e| matches!(e, OutputEvent::WriteFailed { .. })));
    assert!(collected.iter().any(|e| matches!(e, OutputEvent::Recovered { failed_writes: 1 })));
    assert!(collected
        .iter()
        .any(|e| matches!(e, OutputEvent::ParametersSent(p) if p.refresh_rate == 30)));

    let labels = wire.labels();
    assert_eq!(labels[0], MessageLabel::SetParameters);
    assert!(labels.iter().filter(|&&l| l == MessageLabel::OutputOnlySendDmx).count() >= 7);
}

#[test]
fn test_dirty_parameters_retry_until_written() {
    let (mut port, wire) = faulty_port(Parameters::default(), Fault::None);
    wire.block_parameters.store(true, Ordering::SeqCst);

    port.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || port.status().frames_sent >= 4));

    // DMX keeps flowing while the parameters are refused
    let status = port.status();
    assert!(status.parameters_dirty);
    assert_eq!(status.parameter_frames_sent, 0);
    assert!(port.is_started());

    wire.block_parameters.store(false, Ordering::SeqCst);
    assert!(wait_for(Duration::from_secs(2), || !port.status().parameters_dirty));
    port.stop();

    let labels = wire.labels();
    let first_params = labels.iter().position(|&l| l == MessageLabel::SetParameters).unwrap();
    assert!(first_params >= 4);
    assert_eq!(labels.iter().filter(|&&l| l == MessageLabel::SetParameters).count(), 1);
}

#[test]
fn test_stop_mid_cycle_joins_and_releases_transport() {
    let (mut port, wire) = faulty_port(
        Parameters::new(9, 1, 40, 512).unwrap(),
        Fault::Slow(Duration::from_millis(40)),
    );

    port.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || wire.attempts.load(Ordering::SeqCst) >= 2));

    // The loop is inside a slow write right now
    port.stop();

    assert!(wire.released.load(Ordering::SeqCst));
    assert!(!port.is_started());

    let attempts = wire.attempts.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(120));
    assert_eq!(wire.attempts.load(Ordering::SeqCst), attempts);
}

#[test]
fn test_render_does_not_wait_for_slow_writes() {
    let (mut port, wire) =
        faulty_port(Parameters::default(), Fault::Slow(Duration::from_millis(100)));
    port.start().unwrap();
    assert!(wait_for(Duration::from_secs(2), || wire.attempts.load(Ordering::SeqCst) >= 1));

    let started = Instant::now();
    for value in 0..100 {
        port.render_frame(&[value; 512]).unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(100));

    port.stop();
}
