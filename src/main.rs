//! The `ktp` command: run the daemon and the two demo clients either as
//! separate processes attached through the daemon's control socket, or all in
//! one process with `ktp transfer`.

use std::fs;
use std::io;
use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use ktp::{
    Client, Config, Daemon, Error, SeededLoss, SocketApi, SocketId, SocketStats, StoreHandle,
};
use nix::sys::signal::{SigSet, Signal};

const USER1: &str = "127.0.0.1:8080";
const USER2: &str = "127.0.0.1:8081";
/// The size header in front of the file contents.
const HEADER_LEN: usize = 8;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the protocol engine until interrupted, serving client processes
    /// on a control socket.
    Daemon {
        /// Where to listen for client processes.
        #[arg(short, long)]
        control: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Send a file to user2 through a running daemon.
    User1 {
        /// The daemon's control socket.
        #[arg(short, long)]
        control: PathBuf,
        /// File to send.
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Receive a file from user1 through a running daemon.
    User2 {
        /// The daemon's control socket.
        #[arg(short, long)]
        control: PathBuf,
        /// Where to write what arrives.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Send a file from one socket to its peer inside this process and report
    /// the cost.
    Transfer {
        /// File to send.
        #[arg(short, long)]
        input: PathBuf,
        /// Where the receiving side writes what it got.
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Args)]
struct EngineArgs {
    /// Probability that any segment is dropped in transit.
    #[arg(short = 'p', long, default_value_t = ktp::defaults::LOSS_PROBABILITY)]
    loss: f64,
    /// Window size in segments.
    #[arg(short, long, default_value_t = ktp::defaults::WINDOW_SIZE)]
    window: usize,
    /// Largest payload per segment, in bytes.
    #[arg(short, long, default_value_t = ktp::defaults::MESSAGE_SIZE)]
    message_size: usize,
    /// Retransmission timeout in milliseconds.
    #[arg(short, long, default_value_t = ktp::defaults::RETRANSMIT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,
    /// Seed the loss model for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,
}

impl EngineArgs {
    fn config(&self) -> Config {
        Config {
            window_size: self.window,
            message_size: self.message_size,
            loss_probability: self.loss,
            retransmit_timeout: Duration::from_millis(self.timeout_ms),
            ..Config::default()
        }
    }

    fn start(&self, store: &StoreHandle, control: Option<&Path>) -> ktp::Result<Daemon> {
        let mut builder = Daemon::builder(store);
        if let Some(seed) = self.seed {
            builder = builder.loss_model(SeededLoss::new(seed));
        }
        if let Some(path) = control {
            builder = builder.control_socket(path);
        }
        builder.start()
    }
}

fn main() -> io::Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Daemon { control, engine } => daemon(&engine, &control),
        Command::User1 { control, input } => {
            let data = fs::read(&input)?;
            let client = Client::connect(&control)?;
            let rto = client.retransmit_timeout();
            let started = Instant::now();
            let stats = send_file(&client, &data, rto * 10)?;
            report(data.len(), None, started.elapsed(), &stats);
            Ok(())
        }
        Command::User2 { control, output } => {
            let client = Client::connect(&control)?;
            let rto = client.retransmit_timeout();
            let data = receive_file(&client, rto * 3)?;
            fs::write(&output, &data)?;
            log::info!("wrote {} bytes to {}", data.len(), output.display());
            Ok(())
        }
        Command::Transfer {
            input,
            output,
            engine,
        } => transfer(&engine, input, output),
    }
}

/// Serve client processes until SIGINT or SIGTERM.
fn daemon(engine: &EngineArgs, control: &Path) -> io::Result<()> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    // engine threads inherit the mask, leaving the signals to `wait` below
    signals.thread_block()?;

    let store = StoreHandle::create(engine.config())?;
    let daemon = engine.start(&store, Some(control))?;
    let signal = signals.wait()?;
    log::info!("{:?} received, stopping", signal);
    daemon.shutdown();
    store.destroy();
    Ok(())
}

fn transfer(engine: &EngineArgs, input: PathBuf, output: PathBuf) -> io::Result<()> {
    let data = fs::read(&input)?;
    let store = StoreHandle::create(engine.config())?;
    let daemon = engine.start(&store, None)?;
    log::info!(
        "sending {} ({} bytes) with loss probability {}",
        input.display(),
        data.len(),
        store.loss_probability()
    );

    // The receiver lingers like TIME-WAIT so a lost final ACK can still be
    // resent; the sender stops waiting for it after a few more timeouts.
    let rto = store.config().retransmit_timeout;
    let started = Instant::now();
    let receiver = {
        let ktp = store.attach()?;
        thread::spawn(move || receive_file(&ktp, rto * 3))
    };
    let stats = send_file(&store.attach()?, &data, rto * 10)?;
    let received = receiver
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "receiving client panicked"))??;
    let elapsed = started.elapsed();

    fs::write(&output, &received)?;
    daemon.shutdown();
    store.destroy();

    report(data.len(), Some(received == data), elapsed, &stats);
    if received != data {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "received bytes differ from the input",
        ));
    }
    Ok(())
}

fn addrs(local: &str, remote: &str) -> io::Result<(SocketAddrV4, SocketAddrV4)> {
    let parse = |a: &str| {
        a.parse::<SocketAddrV4>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    };
    Ok((parse(local)?, parse(remote)?))
}

/// User 1: the size header, then the file, one message per send.
fn send_file(ktp: &impl SocketApi, data: &[u8], flush_timeout: Duration) -> io::Result<SocketStats> {
    let id = ktp.open()?;
    let (local, remote) = addrs(USER1, USER2)?;
    ktp.bind(id, local, remote)?;

    let header = (data.len() as u64).to_be_bytes();
    let mut sent = 0;
    while sent < header.len() {
        sent += ktp.send_blocking(id, &header[sent..], None)?;
    }
    for chunk in data.chunks(ktp.message_size()) {
        let mut sent = 0;
        while sent < chunk.len() {
            sent += ktp.send_blocking(id, &chunk[sent..], None)?;
        }
    }
    match ktp.flush_blocking(id, Some(flush_timeout)) {
        Err(Error::TimedOut) => log::warn!("final acknowledgment never arrived"),
        other => other?,
    }
    let stats = ktp.stats(id)?;
    ktp.close(id)?;
    Ok(stats)
}

/// User 2: read the size header, then exactly that many bytes.
fn receive_file(ktp: &impl SocketApi, linger: Duration) -> io::Result<Vec<u8>> {
    let id = ktp.open()?;
    let (local, remote) = addrs(USER2, USER1)?;
    ktp.bind(id, local, remote)?;

    let header = read_exact(ktp, id, HEADER_LEN)?;
    let mut len = [0u8; HEADER_LEN];
    len.copy_from_slice(&header);
    let len = u64::from_be_bytes(len) as usize;
    log::info!("expecting {} bytes", len);

    let data = read_exact(ktp, id, len)?;
    thread::sleep(linger);
    ktp.close(id)?;
    Ok(data)
}

fn read_exact(ktp: &impl SocketApi, id: SocketId, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    while buf.len() < len {
        buf.extend(ktp.receive_blocking(id, len - buf.len(), None)?);
    }
    Ok(buf)
}

/// `intact` is known only where both ends ran in this process.
fn report(bytes: usize, intact: Option<bool>, elapsed: Duration, stats: &SocketStats) {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    println!("bytes:          {}", bytes);
    if let Some(intact) = intact {
        println!("intact:         {}", intact);
    }
    println!("elapsed:        {:.3} s", secs);
    println!("throughput:     {:.1} KiB/s", bytes as f64 / 1024.0 / secs);
    println!("segments:       {}", stats.transmitted);
    println!("retransmitted:  {}", stats.retransmitted);
    println!(
        "transmissions per segment: {:.3}",
        stats.transmissions_per_segment()
    );
}
