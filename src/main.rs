use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use std::io::IsTerminal;
use std::time::Duration;
use umpbridge::{
    cli::{prompt_port, validate_port, Args},
    config::Settings,
    logging,
    midi::{list_ports, MidirDevice, PortList},
    session::UdpSessionFactory,
    ui::{spawn_input_listener, StatusDisplay, UiCommand},
    Bridge, ThreadScheduler,
};

const CLIENT_NAME: &str = "umpbridge";
const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    let args = Args::parse();
    let settings = load_settings(&args);
    // Only --list-ports runs without the status spinner
    initialize_logging(&settings.log_level, !args.list_ports);

    let ports = get_available_ports();
    if args.list_ports {
        list_available_ports(&ports);
        return;
    }

    let settings = select_ports(settings, &ports);
    std::process::exit(run_bridge(&settings));
}

fn exit_with_error(error_msg: &str) -> ! {
    log::error!("{}", error_msg);
    eprintln!("{}", error_msg);
    std::process::exit(1);
}

fn load_settings(args: &Args) -> Settings {
    match Settings::load(args.config.as_deref(), &args.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

fn initialize_logging(level: &str, status_display: bool) {
    if let Err(e) = logging::init_logger(level, status_display) {
        eprintln!("Logging unavailable: {}", e);
    }
    log::info!("umpbridge {} starting", env!("CARGO_PKG_VERSION"));
}

fn get_available_ports() -> PortList {
    list_ports(CLIENT_NAME).unwrap_or_else(|e| exit_with_error(&format!("{}", e)))
}

fn list_available_ports(ports: &PortList) {
    println!("MIDI ports to read from (--output-port):");
    for (i, name) in ports.outputs.iter().enumerate() {
        println!("  {}: {}", i, name);
    }
    println!("MIDI ports to write to (--input-port):");
    for (i, name) in ports.inputs.iter().enumerate() {
        println!("  {}: {}", i, name);
    }
}

fn choose_port(kind: &str, selected: Option<usize>, names: &[String]) -> usize {
    if let Some(index) = selected {
        if let Err(error_msg) = validate_port(kind, index, names) {
            exit_with_error(&error_msg);
        }
        return index;
    }

    if names.is_empty() {
        exit_with_error(&format!("Error: no MIDI {} ports available", kind));
    }
    if !std::io::stdin().is_terminal() {
        exit_with_error(&format!("Error: no {} port given (--{}-port)", kind, kind));
    }
    prompt_port(kind, names).unwrap_or_else(|e| exit_with_error(&format!("{}", e)))
}

fn select_ports(mut settings: Settings, ports: &PortList) -> Settings {
    settings.device.output_port = Some(choose_port(
        "output",
        settings.device.output_port,
        &ports.outputs,
    ));
    settings.device.input_port = Some(choose_port(
        "input",
        settings.device.input_port,
        &ports.inputs,
    ));
    settings
}

/// Runs until the user quits or a pump fails; returns the process exit code.
fn run_bridge(settings: &Settings) -> i32 {
    let request = settings
        .start_request()
        .unwrap_or_else(|e| exit_with_error(&format!("{}", e)));
    let bridge = Bridge::new(UdpSessionFactory, settings.bridge_options());

    if let Err(e) = bridge.start(MidirDevice::new(CLIENT_NAME), request.clone()) {
        exit_with_error(&format!("Error starting bridge: {}", e));
    }

    let scheduler = ThreadScheduler::new();
    let commands = spawn_input_listener(&scheduler)
        .unwrap_or_else(|e| exit_with_error(&format!("{}", e)));
    let display = StatusDisplay::new(
        &request.endpoint_name,
        &format!("{}:{}", request.host, request.port),
    );
    display.println("Press Enter or q to stop, s for statistics");

    let mut exit_code = 0;
    loop {
        match commands.recv_timeout(REFRESH_INTERVAL) {
            Ok(UiCommand::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(UiCommand::ShowStats) => {
                display.println(format!("{}", bridge.stats().snapshot()));
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let running = bridge.is_running();
        display.refresh(
            running,
            &bridge.stats().snapshot(),
            bridge.stats().uptime_secs(),
        );
        if !running {
            log::error!("A pump stopped unexpectedly, shutting the bridge down");
            exit_code = 1;
            break;
        }
    }

    if let Err(e) = bridge.stop() {
        log::error!("{}", e);
        exit_code = 1;
    }
    display.finish("stopped");
    exit_code
}
