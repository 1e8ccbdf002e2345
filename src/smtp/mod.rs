//! SMTP ingress: accepts mail for the configured target addresses and runs
//! every received message through the [`Pipeline`] before replying.

mod protocol;

use std::sync::Arc;

use acton_reactive::prelude::*;
use anyhow::Result;
use log::{info, trace, warn};
use protocol::{SessionEvent, SmtpSession};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PipelineError;
use crate::ledger::{InvocationFinished, OutcomeKind};
use crate::mail::IncomingMessage;
use crate::pipeline::{Pipeline, PipelineConfig, ProcessingReport, TerminalAction};

/// Largest DATA payload accepted, advertised through `SIZE`.
pub const MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

/// Everything a connection task needs, shared across connections.
struct Ingress {
    pipeline: Arc<Pipeline>,
    pipeline_config: PipelineConfig,
    target_emails: Vec<String>,
    ledger: ActorHandle,
}

impl Ingress {
    fn accepts(&self, recipient: &str) -> bool {
        self.target_emails
            .iter()
            .any(|target| target.eq_ignore_ascii_case(recipient))
    }
}

// --- SmtpListenerActor ---

#[acton_actor]
pub struct SmtpListenerState;

impl SmtpListenerState {
    pub async fn create(
        runtime: &mut ActorRuntime,
        config: &Config,
        pipeline: Arc<Pipeline>,
        ledger: ActorHandle,
    ) -> anyhow::Result<ActorHandle> {
        let actor_config = ActorConfig::new(Ern::with_root("smtp-listener")?, None, None)?
            .with_restart_policy(RestartPolicy::Permanent);

        let mut builder = runtime.new_actor_with_config::<Self>(actor_config);

        let cancel = CancellationToken::new();
        let cancel_for_loop = cancel.clone();
        let cancel_for_stop = cancel.clone();

        let addr = format!("{}:{}", config.smtp_bind_address, config.smtp_port);
        let ingress = Arc::new(Ingress {
            pipeline,
            pipeline_config: config.pipeline_config(),
            target_emails: config.target_emails.clone(),
            ledger,
        });

        builder.after_start(move |_actor| {
            let addr = addr.clone();
            let ingress = ingress.clone();
            let cancel = cancel_for_loop.clone();

            tokio::spawn(async move {
                let listener = match TcpListener::bind(&addr).await {
                    Ok(l) => {
                        tracing::info!("SMTP server listening on {}", addr);
                        l
                    }
                    Err(e) => {
                        tracing::error!("Failed to bind SMTP: {}", e);
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            match result {
                                Ok((stream, remote_addr)) => {
                                    tracing::info!("New connection from: {}", remote_addr);
                                    let ingress = ingress.clone();
                                    tokio::spawn(async move {
                                        if let Err(e) = handle_connection(stream, ingress).await {
                                            tracing::error!("Error handling SMTP connection from {}: {:#}", remote_addr, e);
                                        }
                                    });
                                }
                                Err(e) => tracing::error!("Error accepting connection: {:?}", e),
                            }
                        }
                        _ = cancel.cancelled() => {
                            tracing::info!("SMTP listener shutting down gracefully");
                            break;
                        }
                    }
                }
            });

            Reply::ready()
        });

        builder.before_stop(move |_| {
            cancel_for_stop.cancel();
            Reply::ready()
        });

        Ok(builder.start().await)
    }
}

// --- Connection handling ---

async fn handle_connection<S>(stream: S, ingress: Arc<Ingress>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut session = SmtpSession::new(
        BufReader::new(read_half),
        BufWriter::new(write_half),
        MAX_MESSAGE_BYTES,
    );

    let mut sender = String::new();
    let mut recipient: Option<String> = None;

    session.greet().await?;

    loop {
        let event = session.next_event().await?;
        trace!("SMTP({:?}): {:?}", session.state(), short(&event));

        match event {
            SessionEvent::Continue => {}
            SessionEvent::Quit => {
                info!("Client quit.");
                return Ok(());
            }
            SessionEvent::Closed => {
                info!("Connection closed by client (EOF). State: {:?}", session.state());
                return Ok(());
            }
            SessionEvent::Reset => {
                sender.clear();
                recipient = None;
            }
            SessionEvent::MailFrom(address) => {
                sender = address;
                recipient = None;
            }
            SessionEvent::RcptTo(address) => {
                if ingress.accepts(&address) {
                    session.reply("250 OK").await?;
                    recipient.get_or_insert(address);
                } else {
                    warn!("Refusing recipient {}", address);
                    session.reply("550 No such user here").await?;
                }
            }
            SessionEvent::DataRequested => {
                if recipient.is_some() {
                    session.begin_data().await?;
                } else {
                    session
                        .reply("503 Bad sequence of commands (no accepted recipient)")
                        .await?;
                }
            }
            SessionEvent::Message(raw) => {
                let Some(to) = recipient.take() else {
                    session.reply("503 Bad sequence of commands").await?;
                    continue;
                };
                let message = IncomingMessage::new(std::mem::take(&mut sender), to, raw);
                info!(
                    "Received email from {} to {} (Subject: '{}')",
                    message.sender, message.recipient, message.subject
                );

                let result = ingress
                    .pipeline
                    .process_message(&message, &ingress.pipeline_config)
                    .await;
                ingress
                    .ledger
                    .send(InvocationFinished {
                        outcome: OutcomeKind::of(&result),
                    })
                    .await;

                session.reply(&reply_for(&result)).await?;
            }
        }
    }
}

/// SMTP reply for the outcome of one invocation.
///
/// Transient failures answer `451` so the sending MTA retries later.
fn reply_for(result: &Result<ProcessingReport, PipelineError>) -> String {
    match result {
        Ok(report) => match &report.action {
            TerminalAction::Forwarded(_) | TerminalAction::Dropped => {
                "250 OK: Message accepted for delivery".to_string()
            }
            TerminalAction::Rejected(reason) => format!("550 5.7.1 Message rejected: {}", reason),
        },
        Err(e @ PipelineError::Decode(_)) => {
            warn!("Refusing message: {}", e);
            "554 5.6.0 Message could not be decoded".to_string()
        }
        Err(e) if e.is_transient() => {
            warn!("Deferring message: {}", e);
            "451 4.3.0 Temporary failure, please retry later".to_string()
        }
        Err(e) => {
            warn!("Refusing message: {}", e);
            format!("550 5.7.0 {}", e)
        }
    }
}

/// Keeps message bodies out of trace output.
fn short(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Message(raw) => format!("Message({} bytes)", raw.len()),
        other => format!("{:?}", other),
    }
}
