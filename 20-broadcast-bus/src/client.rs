use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, config::Framing, framing::PUBLISH_PREFIX};

const READ_CHUNK: usize = 4096;

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let (mut reader, mut writer) = stream.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &mut input, args.framing).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

/// Turns one line typed by the user into the bytes of one message.
pub fn encode_line(line: &str, framing: Framing) -> Vec<u8> {
    let mut message = Vec::with_capacity(line.len() + 1);
    if framing == Framing::Bang {
        message.push(PUBLISH_PREFIX);
    }
    message.extend_from_slice(line.as_bytes());
    message
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    framing: Framing,
) -> Result<()> {
    let mut inbound = vec![0u8; READ_CHUNK];
    loop {
        input.clear();
        select! {
            bytes_read = reader.read(&mut inbound) => {
                if !handle_server_bytes(bytes_read, &inbound).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, framing, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_bytes(bytes_read: io::Result<usize>, buffer: &[u8]) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        write_stderr("*** server closed the connection").await?;
        return Ok(false);
    }
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&buffer[..bytes_read]).await?;
    stdout.flush().await?;
    Ok(true)
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    framing: Framing,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    if input.trim_end().eq_ignore_ascii_case("/quit") {
        write_stderr("*** leaving bus").await?;
        return Ok(false);
    }

    // One write per line: the bus ends a message at the first short read.
    writer.write_all(&encode_line(input, framing)).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
