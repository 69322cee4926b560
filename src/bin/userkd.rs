//! The userkd daemon.

use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use userkd::request::MasterSocket;
use userkd::server::Server;
use userkd::server_dir::setup_server_dirs;

#[derive(Debug, Parser)]
#[command(name = "userkd", about = "user-mode compatibility kernel server")]
struct Args {
    /// Debug level (0-2); raises the log verbosity.
    #[arg(short, long, default_value_t = 0)]
    debug: u8,

    /// Stay in the foreground and log to stderr.
    #[arg(short, long)]
    foreground: bool,

    /// Ask a running server to shut down, then exit.
    #[arg(short, long)]
    kill: bool,

    /// Keep running after the last client exits.
    #[arg(short, long)]
    persistent: bool,
}

fn level_for(debug: u8) -> LevelFilter {
    match debug {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(level_for(args.debug))
        .init();

    let dirs = match setup_server_dirs() {
        Ok(dirs) => dirs,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("config dir {}", dirs.config_dir.display());
    log::info!("server dir {}", dirs.server_dir.display());

    if args.kill {
        // no pid file is kept; removing the socket refuses new clients and
        // the running server exits once the last one disconnects
        let socket = dirs.socket_path();
        if std::fs::remove_file(&socket).is_ok() {
            log::info!("removed {}", socket.display());
            return ExitCode::SUCCESS;
        }
        log::error!("no server socket at {}", socket.display());
        return ExitCode::FAILURE;
    }

    if !args.foreground {
        match unsafe { libc::fork() } {
            -1 => {
                log::error!("fork failed");
                return ExitCode::FAILURE;
            }
            0 => {
                unsafe { libc::setsid() };
            }
            _ => return ExitCode::SUCCESS,
        }
    }

    let server = Server::new();
    server.set_server_dirs(dirs.clone());
    let master = match MasterSocket::create(&server, &dirs.socket_path()) {
        Ok(master) => master,
        Err(err) => {
            log::error!("creating the master socket failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    server.make_static(master);
    if args.persistent {
        log::info!("persistent mode: staying up after the last client exits");
    }

    log::info!("listening on {}", dirs.socket_path().display());
    server.main_loop();
    let _ = std::fs::remove_file(dirs.socket_path());
    ExitCode::SUCCESS
}
