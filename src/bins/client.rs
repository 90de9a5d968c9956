use std::net::SocketAddr;

use clap::{ArgAction, Parser};
use talkers::{client, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

/// talkers chat client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// name to register with the broker
    name: String,

    /// broker address
    server: SocketAddr,

    /// enable debugging logs
    #[arg(short, long, action=ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    simple_logger::SimpleLogger::default()
        .with_level(match args.debug {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .with_utc_timestamps()
        .init()
        .unwrap();

    if let Err(err) = app(args).await {
        eprintln!("{}", err);
        std::process::exit(1);
    }

    Ok(())
}

async fn app(args: Args) -> Result<()> {
    let client = client::connect(args.server, &args.name).await?;
    println!("registered as '{}'", client.id());

    let (mut sender, mut receiver) = client.split();

    let result = tokio::select! {
        result = display(&mut receiver) => result,
        result = pump(&mut sender) => result,
    };

    receiver.close().await;
    result
}

/// Print incoming messages until the stream dies or the server reports
/// an error.
async fn display(receiver: &mut client::Receiver) -> Result<()> {
    loop {
        let (from, content) = receiver.receive().await?;
        println!("{}: {}", from, content);
    }
}

/// Read `<recipient> <message>` lines from stdin and send them out.
async fn pump(sender: &mut client::Sender) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((to, content)) = line.split_once(' ') else {
            eprintln!("usage: <recipient> <message>");
            continue;
        };

        sender.send(to, content.trim()).await?;
    }

    Ok(())
}
