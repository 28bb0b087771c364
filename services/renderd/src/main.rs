use clap::{App, Arg};
use corundum::jail::Jail;
use corundum::render::backend::RendererBackend;
use corundum::render::headless::HeadlessRenderer;
use corundum::render::state;
use corundum::supervisor::Supervisor;
use flux::logging;
use std::fs;

mod config;

use config::{ServerConfig, WorkerMode};

fn backend() -> Box<dyn RendererBackend> {
    Box::new(HeadlessRenderer::new())
}

pub fn main() {
    let matches = App::new("Render Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Serves guest graphics contexts over a local socket.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();

    let config: ServerConfig =
        serde_json::from_reader(fs::File::open(config_file_path).expect("Error opening config file"))
            .expect("Error parsing config file");

    let logger = logging::init(&config.log_level);

    let jail = match (&config.seccomp_bpf, &config.seccomp_policy) {
        (Some(path), _) => Jail::from_bpf_file(path).expect("Error loading seccomp filter"),
        (None, Some(path)) => Jail::from_policy_file(path).expect("Error loading seccomp policy"),
        (None, None) => Jail::none(),
    };

    if config.mode == WorkerMode::Sandboxed && !jail.is_active() {
        panic!("Sandboxed mode requires a seccomp filter or policy");
    }

    logging::info!(
        logger,
        "starting render server";
        "socket" => &config.socket_path,
        "mode" => ?config.mode,
        "jailed" => jail.is_active()
    );

    let mut supervisor = Supervisor::bind(
        &config.socket_path,
        config.mode.scheduling_mode(),
        jail,
        state::instance().clone(),
        backend,
        &logger,
    )
    .expect("Error binding server socket");

    if let Err(err) = supervisor.run() {
        logging::crit!(logger, "server loop failed"; "error" => ?err);
    }

    supervisor.shutdown();
}
