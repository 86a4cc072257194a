use std::{error::Error, io, net::SocketAddr, time::Duration};

use clap::Parser;
use framewire::{Client, Command, prompt};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server to connect to
    address: SocketAddr,
    /// Seconds to wait for the connection and for each reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout);
    let mut client = Client::connect(cli.address, timeout)?;
    println!("connected to {}; '.key <hex>' sets a key, '.exit' quits", client.peer_addr());

    let mut reader;
    let mut writer;
    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        reader = stdio.lock();
        writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(reader, writer) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Key(key) => client.set_key(key),
            Command::Send(line) => {
                client.send(line.as_bytes())?;
                match client.recv_timeout(timeout)? {
                    Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
                    None => eprintln!("no reply within {}s", cli.timeout),
                }
            }
        }
    }

    client.close()?;
    Ok(())
}

/// StdOut wrapper than automatically flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
