use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use netconfd::{
    ClientConfig, Command, Response,
    config::DEFAULT_SOCKET_PATH,
    prompt,
    protocol::{Client, ClientError},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server socket
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 8)]
    timeout: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig {
        socket_path: cli.socket,
        ttl: Duration::from_secs(cli.timeout),
        ..Default::default()
    };
    let client = Client::connect(&config)?;
    println!("connected as session {}", client.session_id());

    let stdin = io::stdin();
    let stdout = io::stdout();
    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let request = match cmd {
            Command::Exit => break,
            Command::Request(request) => request,
        };

        match client.call(&request) {
            Ok(Response::Ok) => println!("ok"),
            Ok(Response::Data(data)) => println!("{data}"),
            Err(ClientError::SessionClosed) => {
                eprintln!("session closed by server");
                return Ok(());
            }
            Err(e) => eprintln!("error: {e}"),
        }
        io::stdout().flush()?;
    }

    if let Err(e) = client.close() {
        eprintln!("failed to close session cleanly: {e}");
    }
    Ok(())
}
