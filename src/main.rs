use clap::Parser;
use rcb_slurper::{
    args,
    capture::{bind_udp, Pipeline, RingSink, Session, READ_TIMEOUT, STOP_TIMEOUT},
    control::{same_network, ControlError, Device, LoggingChannel},
    exfil::{consume_and_drop, file_consumer},
};
use std::{
    io,
    net::SocketAddrV4,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

/// How often link stats are logged
const STATS_PERIOD: Duration = Duration::from_secs(1);
/// How often the battery gets checked
const BATTERY_PERIOD: Duration = Duration::from_secs(5);

fn to_io(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn main() -> io::Result<()> {
    // Get the CLI options
    let cli = args::Args::parse();

    // Logger init
    tracing_subscriber::fmt()
        .with_max_level(args::convert_filter(cli.verbose.log_level_filter()))
        .init();

    if !same_network(cli.device_ip, cli.host_ip) {
        return Err(to_io(ControlError::NetworkMismatch {
            device: cli.device_ip,
            host: cli.host_ip,
        }));
    }

    // Solve and commit the front-end configuration
    let host = SocketAddrV4::new(cli.host_ip, cli.port);
    let mut device = Device::new(LoggingChannel::default(), host, cli.require_chip);
    let commit = device.configure(cli.intent()).map_err(to_io)?.clone();
    info!(
        "Streaming {} channels at {:.3} Hz, {} samples per packet",
        commit.layout.channel_count,
        commit.config.achieved_sample_rate_hz,
        commit.layout.samples_per_packet
    );

    // Setup the capture socket and the buffers
    let socket = bind_udp(cli.port, READ_TIMEOUT)?;
    let pipeline = Pipeline::new(&commit).map_err(to_io)?;

    // Setup the ring buffer out to the consumer
    let (producer, consumer) = rtrb::RingBuffer::new(cli.capacity);
    let consumer_stop = Arc::new(AtomicBool::new(false));
    let thread_stop = consumer_stop.clone();
    let output = cli.output.clone();
    let consumer_handle = thread::Builder::new()
        .name("consumer".to_owned())
        .spawn(move || match output {
            Some(dir) => file_consumer(consumer, &dir, thread_stop).map(|_| ()),
            None => {
                consume_and_drop(consumer, thread_stop);
                Ok(())
            }
        })?;

    // Start capturing before the bridge starts sending
    let session = Session::start(socket, RingSink::new(producer), pipeline).map_err(to_io)?;
    if let Err(e) = device.start_stream() {
        error!("Could not start stream: {}", e);
        session.stop(STOP_TIMEOUT);
        consumer_stop.store(true, Ordering::Relaxed);
        let _ = consumer_handle.join();
        return Err(to_io(e));
    }

    // Stop on Ctrl-C
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::Relaxed)).map_err(to_io)?;

    let mut last_battery = Instant::now();
    while running.load(Ordering::Relaxed) {
        thread::sleep(STATS_PERIOD);
        let snap = session.counters().snapshot();
        info!("{}", snap);
        if last_battery.elapsed() >= BATTERY_PERIOD {
            last_battery = Instant::now();
            if let Some(battery) = snap.battery() {
                device.update_battery(battery);
                if battery.can_stream() {
                    info!("{}", battery);
                } else {
                    warn!("{}", battery);
                }
            }
        }
    }

    info!("Stopping");
    session.stop(STOP_TIMEOUT);
    if let Err(e) = device.stop_stream() {
        warn!("Could not stop stream: {}", e);
    }
    consumer_stop.store(true, Ordering::Relaxed);
    match consumer_handle.join() {
        Ok(res) => res,
        Err(_) => {
            error!("Consumer thread panicked");
            Ok(())
        }
    }
}
