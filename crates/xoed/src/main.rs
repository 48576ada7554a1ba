//! xoed — the X-over-Ethernet relay daemon and client bridges (spec §6).
//!
//! Mode is resolved by `XoeConfig` (env → file → defaults, see
//! `config::XoeConfig::load`), with `--mode` on the command line taking
//! final precedence. `server` mode runs the accept loop and USB/NBD
//! routing; the `client-*` modes run the serial or USB bridge against a
//! remote server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use xoed::config::{Mode, XoeConfig};
use xoed::server::Server;

/// Process exit codes (spec §6): 0 on a clean shutdown, non-zero on fatal
/// configuration or runtime errors.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "xoed", about = "X-over-Ethernet relay daemon")]
struct Cli {
    /// Operating mode; overrides whatever `XoeConfig` resolved from the
    /// environment or config file.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Print the resolved configuration as JSON to stdout and exit, instead
    /// of starting the selected mode. Useful for checking what env/file/
    /// default layering actually produced before handing it to a real run.
    #[arg(long)]
    dump_config: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match XoeConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }

    if cli.dump_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!(error = %e, "failed to serialise configuration");
                std::process::exit(EXIT_RUNTIME_ERROR);
            }
        }
        std::process::exit(EXIT_OK);
    }

    let code = match config.mode {
        Mode::Help => {
            print_help();
            EXIT_OK
        }
        Mode::Server => run_server(config),
        Mode::ClientSerial => run_client_serial(config),
        Mode::ClientUsb => run_client_usb(config),
        Mode::ClientStd => run_client_std(config),
    };

    std::process::exit(code);
}

fn print_help() {
    println!("xoed --mode <server|client-std|client-serial|client-usb>");
    println!("configuration is resolved from $XOE_CONFIG, $XDG_CONFIG_HOME/xoe/config.toml, or defaults");
}

/// Installs a `ctrlc` handler flipping a shared `AtomicBool`, matching the
/// cooperative shutdown-by-signalling model spec §5 describes for every
/// long-running thread in this daemon (no thread is ever killed outright).
fn install_shutdown_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutdown signal received");
        flag.store(true, Ordering::SeqCst);
    }) {
        error!(error = %e, "failed to install signal handler");
    }
    shutdown
}

fn run_server(config: XoeConfig) -> i32 {
    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to construct server");
            return EXIT_CONFIG_ERROR;
        }
    };

    let shutdown = install_shutdown_handler();
    match server.run(shutdown) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "server exited with an error");
            EXIT_RUNTIME_ERROR
        }
    }
}

fn run_client_serial(config: XoeConfig) -> i32 {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
    use xoed::serial_bridge::{SerialBridge, SerialPort};

    let Some(device_path) = config.serial.device.clone() else {
        error!("client-serial mode requires serial.device to be configured");
        return EXIT_CONFIG_ERROR;
    };

    info!(device = %device_path.display(), "client-serial mode starting (device I/O is host-specific and not wired up in this build)");

    let server_ip = config
        .network
        .connect_server_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = SocketAddr::new(server_ip, config.network.connect_server_port);

    let network = match TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, %addr, "failed to connect to server");
            return EXIT_RUNTIME_ERROR;
        }
    };

    // No concrete `tcsetattr`-level port is wired into this build (spec §1
    // scopes that out); a real deployment supplies its own `SerialPort`.
    struct UnconfiguredPort;
    impl SerialPort for UnconfiguredPort {
        fn read(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(std::time::Duration::from_millis(100));
            Ok(0)
        }
        fn write(&self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(_buf.len())
        }
    }

    let shutdown = install_shutdown_handler();
    let bridge = Arc::new(SerialBridge::new(Arc::new(UnconfiguredPort)));
    let handles = bridge.spawn(network);

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    bridge.close();
    for h in handles {
        let _ = h.join();
    }
    EXIT_OK
}

fn run_client_usb(config: XoeConfig) -> i32 {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
    use xoed::usb_client::{UsbClientBridge, UsbDevice};

    if config.usb.devices.is_empty() {
        error!("client-usb mode requires at least one usb.devices entry");
        return EXIT_CONFIG_ERROR;
    }

    let server_ip = config
        .network
        .connect_server_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = SocketAddr::new(server_ip, config.network.connect_server_port);

    let network = match TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, %addr, "failed to connect to server");
            return EXIT_RUNTIME_ERROR;
        }
    };

    // No concrete `libusb` transfer is wired into this build (spec §1
    // scopes that out); a real deployment supplies its own `UsbDevice`.
    struct UnconfiguredDevice;
    impl UsbDevice for UnconfiguredDevice {
        fn transfer(
            &self,
            _endpoint: u8,
            _transfer_type: u8,
            _setup: &[u8; xoe_core::usb::SETUP_LEN],
            data: &[u8],
        ) -> std::io::Result<Vec<u8>> {
            Ok(data.to_vec())
        }
    }

    let devices: Vec<_> = config
        .usb
        .devices
        .iter()
        .cloned()
        .map(|cfg| (cfg, Arc::new(UnconfiguredDevice) as Arc<dyn UsbDevice>))
        .collect();

    let mut bridge = match UsbClientBridge::connect(network, devices, config.usb.auth_secret.into_bytes()) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "USB client registration failed");
            return EXIT_RUNTIME_ERROR;
        }
    };

    bridge.run_reader();
    bridge.join();
    EXIT_OK
}

/// `CLIENT_STD` bridges a plain stdin/stdout stream as Raw-protocol packets
/// (spec §4.A) — the simplest of the three client modes, useful for
/// scripting and manual testing against a running server.
fn run_client_std(config: XoeConfig) -> i32 {
    use std::io::{self, Read, Write};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
    use xoe_core::envelope::{self, Packet, ProtocolId};

    let server_ip = config
        .network
        .connect_server_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let addr = SocketAddr::new(server_ip, config.network.connect_server_port);

    let mut network = match TcpStream::connect(addr) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, %addr, "failed to connect to server");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let mut reader_net = match network.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to clone network socket");
            return EXIT_RUNTIME_ERROR;
        }
    };
    let echo_thread = std::thread::spawn(move || loop {
        match envelope::recv_packet(&mut reader_net) {
            Ok(packet) => {
                let _ = io::stdout().write_all(&packet.payload);
                let _ = io::stdout().flush();
            }
            Err(_) => return,
        }
    });

    let mut chunk = [0u8; 4096];
    loop {
        match io::stdin().read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let packet = Packet::new(ProtocolId::Raw, 1, chunk[..n].to_vec());
                if envelope::send_packet(&mut network, &packet).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let _ = network.shutdown(std::net::Shutdown::Both);
    let _ = echo_thread.join();
    EXIT_OK
}
