// Plain-text operator console.
//
// Reads commands from stdin and renders `UiUpdate`s on stdout. Spin ticks and
// countdown ticks overwrite the current line; everything else is appended.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use sweepdraw_core::connection::{ChannelState, ConnectionStatus, Connectivity, Source};
use sweepdraw_core::countdown::CountdownTick;
use sweepdraw_core::presentation::{Phase, PresentationEvent, Reveal};

use crate::protocol::{CommandError, UiUpdate, UserCommand};

const HELP: &str = "commands: next | all | join <name> | paid <id> | board | status | quit";

/// One piece of console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Line(String),
    /// Replaced by the next output.
    Transient(String),
}

/// Turns UI updates into console output. Remembers the reveal in progress so
/// the reveal line can be printed when the drawn slot is shown.
#[derive(Debug, Default)]
pub struct Renderer {
    current: Option<Reveal>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, update: &UiUpdate) -> Vec<Output> {
        match update {
            UiUpdate::Presentation(event) => self.render_presentation(event),
            UiUpdate::Connection(status) => vec![Output::Line(connection_line(status))],
            UiUpdate::Countdown(CountdownTick::Remaining(left)) => {
                vec![Output::Transient(format!("draw opens in {left}"))]
            }
            UiUpdate::Countdown(CountdownTick::Expired) => {
                vec![Output::Line("the draw is open".to_string())]
            }
            UiUpdate::Board { entries, waiting } => {
                let mut lines = Vec::with_capacity(entries.len() + waiting.len() + 1);
                for entry in entries {
                    let holder = match (&entry.participant_name, &entry.participant_id) {
                        (Some(name), _) => name.clone(),
                        (None, Some(id)) => format!("participant {id}"),
                        (None, None) if entry.scratched => "(scratched)".to_string(),
                        (None, None) => "-".to_string(),
                    };
                    lines.push(Output::Line(format!(
                        "#{:>3} {:<20} {holder}",
                        entry.slot_number, entry.slot_name
                    )));
                }
                lines.push(Output::Line(format!("waiting: {}", waiting.len())));
                for w in waiting {
                    let state = match (&w.pay_within, w.paid) {
                        (_, true) => "paid".to_string(),
                        (Some(left), false) => format!("pending, {left} to pay"),
                        (None, false) => "pending".to_string(),
                    };
                    lines.push(Output::Line(format!(
                        "  {} [{state}] ({})",
                        w.display_name, w.participant_id
                    )));
                }
                lines
            }
            UiUpdate::Status {
                connection,
                presentation,
                participants,
                allocations,
            } => vec![
                Output::Line(connection_line(connection)),
                Output::Line(format!(
                    "presentation: {} ({} queued)",
                    presentation.phase, presentation.queued
                )),
                Output::Line(format!(
                    "{participants} participants, {allocations} allocations"
                )),
            ],
            UiUpdate::Notice(text) => vec![Output::Line(text.clone())],
            UiUpdate::Error(text) => vec![Output::Line(format!("! {text}"))],
        }
    }

    fn render_presentation(&mut self, event: &PresentationEvent) -> Vec<Output> {
        match event {
            PresentationEvent::CycleStarted(reveal) => {
                self.current = Some(reveal.clone());
                vec![Output::Line(format!("drawing for {}...", holder(reveal)))]
            }
            PresentationEvent::SpinTick(value) => {
                vec![Output::Transient(format!("  #{value:>3}"))]
            }
            PresentationEvent::PhaseChanged(Phase::Revealing) => match &self.current {
                Some(reveal) => vec![Output::Line(format!(
                    "  #{} {} -> {}",
                    reveal.slot_number,
                    reveal.slot_name,
                    holder(reveal)
                ))],
                None => Vec::new(),
            },
            PresentationEvent::PhaseChanged(_) => Vec::new(),
            PresentationEvent::CycleCompleted(_) => {
                self.current = None;
                Vec::new()
            }
        }
    }
}

fn holder(reveal: &Reveal) -> String {
    reveal
        .participant_name
        .clone()
        .unwrap_or_else(|| format!("participant {}", reveal.participant_id))
}

fn channel_label(channel: &ChannelState) -> String {
    let connectivity = match channel.connectivity {
        Connectivity::Connected => "connected",
        Connectivity::Reconnecting => "reconnecting",
        Connectivity::Disconnected => "disconnected",
    };
    let source = match channel.source {
        Source::Push => "push",
        Source::Poll => "poll",
    };
    match &channel.last_error {
        Some(err) if channel.connectivity != Connectivity::Connected => {
            format!("{connectivity} via {source} ({err})")
        }
        _ => format!("{connectivity} via {source}"),
    }
}

pub fn connection_line(status: &ConnectionStatus) -> String {
    let mut line = format!(
        "participants: {}; allocations: {}",
        channel_label(&status.participants),
        channel_label(&status.allocations)
    );
    if status.polling {
        line.push_str("; polling");
    }
    if status.degraded {
        line.push_str("; CONNECTIVITY DEGRADED");
    }
    line
}

// ---------------------------------------------------------------------------
// Console loop
// ---------------------------------------------------------------------------

/// Run until the app stops sending updates. End of input counts as `quit`.
pub async fn run(
    mut ui_rx: mpsc::Receiver<UiUpdate>,
    cmd_tx: mpsc::Sender<UserCommand>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = tokio::io::stdout();
    let mut renderer = Renderer::new();
    let mut transient = false;
    let mut input_open = true;

    write_output(&mut out, &Output::Line(HELP.to_string()), &mut transient).await?;

    loop {
        tokio::select! {
            update = ui_rx.recv() => {
                let Some(update) = update else { break };
                for output in renderer.render(&update) {
                    write_output(&mut out, &output, &mut transient).await?;
                }
            }

            line = lines.next_line(), if input_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => match line.parse::<UserCommand>() {
                        Ok(cmd) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Err(CommandError::Empty) => {}
                        Err(e) => {
                            write_output(&mut out, &Output::Line(format!("! {e}")), &mut transient)
                                .await?;
                        }
                    },
                    None => {
                        info!("stdin closed; quitting");
                        input_open = false;
                        let _ = cmd_tx.send(UserCommand::Quit).await;
                    }
                }
            }
        }
    }

    if transient {
        out.write_all(b"\n").await?;
    }
    out.flush().await?;
    Ok(())
}

async fn write_output<W: AsyncWrite + Unpin>(
    out: &mut W,
    output: &Output,
    transient: &mut bool,
) -> std::io::Result<()> {
    match output {
        Output::Line(text) => {
            if *transient {
                out.write_all(b"\r\x1b[2K").await?;
            }
            out.write_all(text.as_bytes()).await?;
            out.write_all(b"\n").await?;
            *transient = false;
        }
        Output::Transient(text) => {
            out.write_all(b"\r\x1b[2K").await?;
            out.write_all(text.as_bytes()).await?;
            *transient = true;
        }
    }
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WaitingEntry;
    use std::time::Duration;
    use sweepdraw_core::countdown::Remaining;
    use sweepdraw_core::live_view::BoardEntry;

    fn reveal(name: Option<&str>) -> Reveal {
        Reveal {
            allocation_id: "a1".into(),
            participant_id: "p1".into(),
            participant_name: name.map(str::to_string),
            slot_number: 7,
            slot_name: "Horse 7".into(),
        }
    }

    fn lines(outputs: Vec<Output>) -> Vec<String> {
        outputs
            .into_iter()
            .map(|o| match o {
                Output::Line(s) | Output::Transient(s) => s,
            })
            .collect()
    }

    #[test]
    fn reveal_line_printed_when_slot_is_shown() {
        let mut r = Renderer::new();
        let started = r.render(&UiUpdate::Presentation(PresentationEvent::CycleStarted(
            reveal(Some("Ada")),
        )));
        assert_eq!(lines(started), vec!["drawing for Ada..."]);

        assert_eq!(
            r.render(&UiUpdate::Presentation(PresentationEvent::SpinTick(3))),
            vec![Output::Transient("  #  3".into())]
        );
        assert_eq!(
            lines(r.render(&UiUpdate::Presentation(PresentationEvent::PhaseChanged(
                Phase::Revealing
            )))),
            vec!["  #7 Horse 7 -> Ada"]
        );
        assert!(r
            .render(&UiUpdate::Presentation(PresentationEvent::CycleCompleted(
                reveal(Some("Ada"))
            )))
            .is_empty());
    }

    #[test]
    fn unknown_participant_falls_back_to_id() {
        let mut r = Renderer::new();
        let out = r.render(&UiUpdate::Presentation(PresentationEvent::CycleStarted(
            reveal(None),
        )));
        assert_eq!(lines(out), vec!["drawing for participant p1..."]);
    }

    #[test]
    fn connection_line_flags_polling_and_degraded() {
        let mut status = ConnectionStatus::default();
        assert_eq!(
            connection_line(&status),
            "participants: reconnecting via push; allocations: reconnecting via push"
        );

        status.polling = true;
        status.degraded = true;
        status.allocations.connectivity = Connectivity::Disconnected;
        status.allocations.source = Source::Poll;
        status.allocations.last_error = Some("connection lost".into());
        let line = connection_line(&status);
        assert!(line.contains("allocations: disconnected via poll (connection lost)"));
        assert!(line.ends_with("; polling; CONNECTIVITY DEGRADED"));
    }

    #[test]
    fn countdown_ticks_are_transient() {
        let mut r = Renderer::new();
        assert_eq!(
            r.render(&UiUpdate::Countdown(CountdownTick::Remaining(Remaining(
                Duration::from_secs(65)
            )))),
            vec![Output::Transient("draw opens in 00:01:05".into())]
        );
        assert_eq!(
            r.render(&UiUpdate::Countdown(CountdownTick::Expired)),
            vec![Output::Line("the draw is open".into())]
        );
    }

    #[test]
    fn board_rows_and_waiting_list() {
        let mut r = Renderer::new();
        let update = UiUpdate::Board {
            entries: vec![
                BoardEntry {
                    slot_number: 1,
                    slot_name: "Horse 1".into(),
                    scratched: false,
                    participant_id: Some("p1".into()),
                    participant_name: Some("Ada".into()),
                },
                BoardEntry {
                    slot_number: 2,
                    slot_name: "Horse 2".into(),
                    scratched: true,
                    participant_id: None,
                    participant_name: None,
                },
            ],
            waiting: vec![WaitingEntry {
                participant_id: "p2".into(),
                display_name: "Grace".into(),
                paid: false,
                pay_within: Some("00:10:00".into()),
            }],
        };
        let out = lines(r.render(&update));
        assert_eq!(out.len(), 4);
        assert!(out[0].starts_with("#  1 Horse 1"));
        assert!(out[0].ends_with("Ada"));
        assert!(out[1].ends_with("(scratched)"));
        assert_eq!(out[2], "waiting: 1");
        assert_eq!(out[3], "  Grace [pending, 00:10:00 to pay] (p2)");
    }

    #[tokio::test]
    async fn transient_output_is_cleared_by_next_line() {
        let mut buf: Vec<u8> = Vec::new();
        let mut transient = false;
        write_output(&mut buf, &Output::Transient("  #  4".into()), &mut transient)
            .await
            .unwrap();
        assert!(transient);
        write_output(&mut buf, &Output::Line("done".into()), &mut transient)
            .await
            .unwrap();
        assert!(!transient);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "\r\x1b[2K  #  4\r\x1b[2Kdone\n"
        );
    }
}
