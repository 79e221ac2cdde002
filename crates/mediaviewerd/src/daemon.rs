use std::sync::Arc;

use anyhow::Context;
use mediaviewer_core::{
    ConfigSource, Forwarder, ForwarderHandle, MediaEvent, Outcome, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::EventFile;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum InCmd {
    RoomMessage {
        #[serde(default)]
        request_id: Option<String>,
        event_id: String,
        room_id: String,
        sender: String,
        content: serde_json::Value,
    },
    ReloadConfig {
        #[serde(default)]
        request_id: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        request_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutMsg {
    Ready {
        protocol_version: u32,
        bot_user_id: String,
        mode: String,
    },
    Reply {
        room_id: String,
        in_reply_to: String,
        body: String,
    },
    Skipped {
        event_id: String,
        reason: String,
    },
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
}

fn out_error(request_id: Option<String>, code: &str, message: impl Into<String>) -> OutMsg {
    OutMsg::Error {
        request_id,
        code: code.to_string(),
        message: message.into(),
    }
}

fn out_ok(request_id: Option<String>, result: Option<serde_json::Value>) -> OutMsg {
    OutMsg::Ok { request_id, result }
}

async fn write_lines<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<OutMsg>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let line = serde_json::to_string(&msg).context("encode out msg")?;
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

async fn read_commands<R>(
    input: R,
    cmd_tx: mpsc::UnboundedSender<InCmd>,
    out_tx: mpsc::UnboundedSender<OutMsg>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = tokio::io::BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "failed to read command input");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<InCmd>(trimmed) {
            Ok(cmd) => {
                if cmd_tx.send(cmd).is_err() {
                    break;
                }
            }
            Err(err) => {
                // The line may carry event content; only the parse error is reported.
                warn!(%err, "invalid command json");
                out_tx
                    .send(out_error(None, "bad_command", err.to_string()))
                    .ok();
            }
        }
    }
}

/// Reload the config source and swap the forwarder; the old one stays on failure
fn reload(source: &ConfigSource, bot_user_id: &UserId, handle: &ForwarderHandle) -> OutMsg {
    match source.load() {
        Ok(config) => {
            let mode = config.mode;
            handle.replace(Forwarder::from_config(&config, bot_user_id.clone()));
            info!(%mode, "configuration reloaded");
            out_ok(None, Some(json!({ "mode": mode.as_str() })))
        }
        Err(err) => {
            warn!(error.kind = err.kind(), error = %err, "configuration reload failed, keeping previous");
            out_error(None, err.kind(), err.to_string())
        }
    }
}

fn with_request_id(msg: OutMsg, id: Option<String>) -> OutMsg {
    match msg {
        OutMsg::Ok { result, .. } => OutMsg::Ok {
            request_id: id,
            result,
        },
        OutMsg::Error { code, message, .. } => OutMsg::Error {
            request_id: id,
            code,
            message,
        },
        other => other,
    }
}

async fn forward_event(
    forwarder: Arc<Forwarder>,
    event: MediaEvent,
    request_id: Option<String>,
    out_tx: mpsc::UnboundedSender<OutMsg>,
) {
    let outcome = forwarder.handle(&event).await;
    if let Outcome::Skipped(reason) = &outcome {
        out_tx
            .send(OutMsg::Skipped {
                event_id: event.event_id.clone(),
                reason: reason.as_str().to_string(),
            })
            .ok();
    }
    if let Some(body) = outcome.reply() {
        out_tx
            .send(OutMsg::Reply {
                room_id: event.room_id.clone(),
                in_reply_to: event.event_id.clone(),
                body: body.to_string(),
            })
            .ok();
    }
    out_tx
        .send(out_ok(
            request_id,
            Some(json!({ "event_id": event.event_id, "outcome": outcome.as_str() })),
        ))
        .ok();
}

/// Drive the forwarder from JSONL commands on `input`, writing JSONL to `output`.
///
/// Each room message runs as its own task against the forwarder snapshot that
/// was current when it arrived. A unit on `reloads` behaves like a
/// `reload_config` command. Returns after `shutdown` or end of input, once
/// in-flight events have finished.
pub async fn run_daemon<R, W>(
    input: R,
    output: W,
    source: ConfigSource,
    bot_user_id: UserId,
    mut reloads: mpsc::UnboundedReceiver<()>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let config = source.load().context("load configuration")?;
    let handle = ForwarderHandle::new(Forwarder::from_config(&config, bot_user_id.clone()));
    info!(
        bot_user_id = %bot_user_id,
        mode = %config.mode,
        timeout_secs = config.request_timeout.as_secs(),
        "mediaviewerd starting"
    );

    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutMsg>();
    let writer = tokio::spawn(write_lines(output, out_rx));

    out_tx
        .send(OutMsg::Ready {
            protocol_version: PROTOCOL_VERSION,
            bot_user_id: bot_user_id.to_string(),
            mode: config.mode.to_string(),
        })
        .ok();

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<InCmd>();
    let reader = tokio::spawn(read_commands(input, cmd_tx, out_tx.clone()));

    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    InCmd::RoomMessage { request_id, event_id, room_id, sender, content } => {
                        let event = match (EventFile { event_id, room_id, sender, content }).into_event() {
                            Ok(event) => event,
                            Err(err) => {
                                warn!(error.kind = err.kind(), "rejected room message");
                                out_tx.send(out_error(request_id, err.kind(), err.to_string())).ok();
                                continue;
                            }
                        };
                        tasks.spawn(forward_event(handle.current(), event, request_id, out_tx.clone()));
                    }
                    InCmd::ReloadConfig { request_id } => {
                        let msg = reload(&source, &bot_user_id, &handle);
                        out_tx.send(with_request_id(msg, request_id)).ok();
                    }
                    InCmd::Shutdown { request_id } => {
                        info!("shutdown requested");
                        out_tx.send(out_ok(request_id, None)).ok();
                        break;
                    }
                }
            }
            Some(()) = reloads.recv() => {
                info!("reload signal received");
                out_tx.send(reload(&source, &bot_user_id, &handle)).ok();
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    warn!(%err, "event task failed");
                }
            }
        }
    }

    reader.abort();
    let _ = reader.await;
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(%err, "event task failed");
        }
    }
    drop(out_tx);
    writer.await.context("join stdout writer")??;
    Ok(())
}

/// [`run_daemon`] over stdin/stdout, reloading on SIGHUP and stopping on Ctrl-C
pub async fn daemon_main(source: ConfigSource, bot_user_id: UserId) -> anyhow::Result<()> {
    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    spawn_reload_signal(reload_tx);

    tokio::select! {
        res = run_daemon(tokio::io::stdin(), tokio::io::stdout(), source, bot_user_id, reload_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, exiting");
            Ok(())
        }
    }
}

#[cfg(unix)]
fn spawn_reload_signal(reload_tx: mpsc::UnboundedSender<()>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "cannot listen for SIGHUP; reload via reload_config only");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            if reload_tx.send(()).is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_signal(_reload_tx: mpsc::UnboundedSender<()>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        let cmd: InCmd = serde_json::from_str(
            r#"{"cmd":"room_message","event_id":"$e","room_id":"!r","sender":"@a:b","content":{"msgtype":"m.text"}}"#,
        )
        .unwrap();
        assert!(matches!(cmd, InCmd::RoomMessage { request_id: None, .. }));

        let cmd: InCmd =
            serde_json::from_str(r#"{"cmd":"reload_config","request_id":"7"}"#).unwrap();
        assert!(matches!(cmd, InCmd::ReloadConfig { request_id: Some(ref id) } if id == "7"));

        assert!(serde_json::from_str::<InCmd>(r#"{"cmd":"send_message"}"#).is_err());
    }

    #[test]
    fn encodes_messages() {
        let line = serde_json::to_value(OutMsg::Reply {
            room_id: "!r".into(),
            in_reply_to: "$e".into(),
            body: "https://v/1#k".into(),
        })
        .unwrap();
        assert_eq!(
            line,
            json!({"type": "reply", "room_id": "!r", "in_reply_to": "$e", "body": "https://v/1#k"})
        );

        let line = serde_json::to_value(out_ok(None, None)).unwrap();
        assert_eq!(line, json!({"type": "ok"}));

        let line = serde_json::to_value(with_request_id(out_error(None, "x", "y"), Some("3".into())))
            .unwrap();
        assert_eq!(
            line,
            json!({"type": "error", "request_id": "3", "code": "x", "message": "y"})
        );
    }
}
