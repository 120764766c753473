#![allow(dead_code)]

use anyhow::Context as _;
use std::io::BufRead as _;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Env keys the gateway reads; cleared so the developer's shell can't leak into tests.
const GATEWAY_ENV: &[&str] = &[
    "DEVGW_CONFIG",
    "DEVGW_BIND",
    "DEVGW_LOG",
    "KAMUI_CODE_URL",
    "MCP_AUTH",
    "BACKEND_TARGET",
    "JSON_LIMIT",
    "UPLOAD_URL",
    "UPLOAD_API_KEY",
    "API_KEY",
    "UPLOAD_FIELD_NAME",
    "DEVGW_STATIC_DIR",
    "DEVGW_PUBLIC_DIR",
    "DEVGW_SAVES_DIR",
    "CLAUDE_MCP_CONFIG_PATH",
    "PUBLIC_BASE_URL",
];

/// Kills the child process when dropped.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

pub struct SpawnedGateway {
    pub child: KillOnDrop,
    pub base: String,
}

fn parse_listen_addr(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    // JSON logs: the address ends before the next quote or brace.
    let end = rest
        .find('"')
        .or_else(|| rest.find('}'))
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

pub fn wait_for_gateway_port(mut child: Child, timeout: Duration) -> anyhow::Result<SpawnedGateway> {
    let stdout = child.stdout.take().context("missing child stdout")?;
    let stderr = child.stderr.take().context("missing child stderr")?;

    let (tx, rx) = mpsc::channel::<String>();
    let tx_out = tx.clone();
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx_out.send(line);
        }
    });
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(stderr);
        for line in reader.lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let start = Instant::now();
    let mut last_lines: Vec<String> = Vec::new();

    while start.elapsed() < timeout {
        if let Ok(Some(status)) = child.try_wait() {
            anyhow::bail!(
                "gateway process exited early: {status}; last output:\n{}",
                last_lines.join("\n")
            );
        }

        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                if last_lines.len() >= 50 {
                    last_lines.remove(0);
                }
                last_lines.push(line.clone());

                if let Some(addr) = parse_listen_addr(&line, "Starting HTTP server on ") {
                    return Ok(SpawnedGateway {
                        child: KillOnDrop(child),
                        base: format!("http://{addr}"),
                    });
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = child.kill();
    anyhow::bail!(
        "timed out waiting for gateway port; last output:\n{}",
        last_lines.join("\n")
    );
}

/// A gateway command with a clean environment rooted at `workdir`.
pub fn gateway_command(workdir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_devgw"));
    for key in GATEWAY_ENV {
        cmd.env_remove(key);
    }
    cmd.current_dir(workdir)
        .env("DEVGW_ENV_FILE", workdir.join("no-such.env"))
        .env("DEVGW_BIND", "127.0.0.1:0")
        .env("DEVGW_LOG", "info");
    cmd
}

pub fn spawn_gateway(workdir: &Path, envs: &[(&str, &str)]) -> anyhow::Result<SpawnedGateway> {
    let mut cmd = gateway_command(workdir);
    cmd.envs(envs.iter().copied())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = cmd.spawn().context("spawn gateway")?;
    wait_for_gateway_port(child, Duration::from_secs(10))
}

/// Serve `app` on an ephemeral loopback port.
pub async fn start_mock(app: axum::Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock");
    let addr = listener.local_addr().expect("mock addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock");
    });
    (format!("http://{addr}"), handle)
}
