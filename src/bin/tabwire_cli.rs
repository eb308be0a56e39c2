use std::{error::Error, io, net::SocketAddr};

use clap::Parser;
use tabwire::{
    StorageClient,
    cli::{Input, Session, prompt},
    config::ClientConfig,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of a running tabwire-server
    address: SocketAddr,
    #[command(flatten)]
    client: ClientConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = StorageClient::connect(cli.address, cli.client)?;
    let mut session = Session::new(client);

    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        let reader = stdio.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let input = match prompt(reader, writer) {
            Ok(input) => input,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        let exit = input == Input::Exit;

        match session.execute(input) {
            Ok(None) => {}
            Ok(Some(out)) => println!("{out}"),
            Err(e) => eprintln!("error: {e}"),
        }
        if exit {
            break;
        }
    }

    if let Err(e) = session.close() {
        eprintln!("failed to close the connection cleanly. error: {e}");
    }
    Ok(())
}

/// StdOut wrapper that flushes after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
