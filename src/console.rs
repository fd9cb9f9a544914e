use anyhow::Result;
use termshell_core::{CancellationToken, ShellBridge, ShellService};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::LaunchArgs;

enum Event {
    Input(Option<String>),
    Output(Option<String>),
    Stop,
}

/// Run `command` in a fresh shell, print what it writes, and exit the shell.
pub async fn run(
    bridge: &ShellBridge,
    launch: &LaunchArgs,
    command: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let mut handle = bridge
        .run_command(&launch.cwd, command, &launch.encoding, &launch.env, cancel.clone())
        .await?;
    handle.write_input("exit").await?;

    let mut stdout = tokio::io::stdout();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => None,
            text = handle.read_text() => text?,
        };
        match chunk {
            Some(text) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            None => break,
        }
    }

    handle.terminate().await?;
    Ok(())
}

/// Attach stdin and stdout to an interactive shell until it exits, stdin
/// closes and the shell finishes, or the user interrupts.
pub async fn interactive(
    bridge: &ShellBridge,
    launch: &LaunchArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let mut handle = bridge
        .launch_shell(&launch.cwd, &launch.encoding, &launch.env, cancel.clone())
        .await?;
    tracing::debug!(session = %handle.id(), encoding = handle.encoding(), "Interactive session ready");

    let (tx, mut rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => Event::Stop,
            line = rx.recv(), if stdin_open => Event::Input(line),
            text = handle.read_text() => Event::Output(text?),
        };
        match event {
            Event::Input(Some(line)) => handle.write_input(&line).await?,
            Event::Input(None) => {
                stdin_open = false;
                handle.write_input("exit").await?;
            }
            Event::Output(Some(text)) => {
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }
            Event::Output(None) | Event::Stop => break,
        }
    }

    handle.terminate().await?;
    Ok(())
}
