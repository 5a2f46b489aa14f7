use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::mpsc,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_bus_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("broadcast-bus");

    let (mut bus_child, mut bus_log) = spawn_bus(&binary).await?;
    let addr = read_bus_addr(&mut bus_log).await?;

    let mut client = spawn_client(&binary, &addr).await?;
    expect_log(&mut bus_log, "client connected").await?;

    let mut observer = TcpStream::connect(addr.as_str())
        .await
        .context("observer connect")?;
    expect_log(&mut bus_log, "client connected").await?;

    // A stdin line becomes one message, relayed byte-for-byte.
    client
        .send_line("hello from the client")
        .await
        .context("client send line")?;
    let relayed = read_exact(&mut observer, "hello from the client\n".len()).await?;
    assert_eq!(relayed, b"hello from the client\n");
    let echo = read_line_expect(&mut client.stdout, "waiting for client echo").await?;
    assert_eq!(echo, "hello from the client");

    // Raw bytes from a plain TCP peer show up on the client's stdout.
    observer.write_all(b"hi there\n").await?;
    let heard = read_line_expect(&mut client.stdout, "waiting for observer message").await?;
    assert_eq!(heard, "hi there");
    let own = read_exact(&mut observer, "hi there\n".len()).await?;
    assert_eq!(own, b"hi there\n");

    client.send_line("/quit").await.context("client send quit")?;
    expect_log(&mut bus_log, "client disconnected").await?;
    ensure_success(&mut client.child, "client").await?;

    // The bus runs until it is stopped; terminate it manually.
    let _ = bus_child.kill().await;
    let _ = bus_child.wait().await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.flush().await?;
        Ok(())
    }
}

/// Spawns the bus and forwards its log lines over a channel so the pipe
/// never fills while the test is busy elsewhere.
async fn spawn_bus(binary: &Path) -> Result<(Child, mpsc::UnboundedReceiver<String>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--accept-timeout-ms")
        .arg("50")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn bus")?;
    let stdout = child
        .stdout
        .take()
        .context("bus stdout missing after spawn")?;

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    Ok((child, rx))
}

async fn expect_log(log: &mut mpsc::UnboundedReceiver<String>, needle: &str) -> Result<String> {
    loop {
        let line = timeout(READ_TIMEOUT, log.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for bus log '{needle}'"))?
            .ok_or_else(|| anyhow!("bus exited before logging '{needle}'"))?;
        if line.contains(needle) {
            return Ok(line);
        }
    }
}

async fn read_bus_addr(log: &mut mpsc::UnboundedReceiver<String>) -> Result<String> {
    let line = expect_log(log, "bus listening on").await?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected bus banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("bus banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn client")?;
    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    timeout(READ_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| anyhow!("timed out reading {len} bytes"))??;
    Ok(buf)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    let mut line = String::new();
    let byte_count = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{description}: timed out"))??;
    if byte_count == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
