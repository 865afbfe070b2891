// ===============================
// src/recorder.rs
// ===============================
//
// JSONL journal: intents are written before they are sent, then every
// lifecycle transition and risk rejection.
// - BufWriter to save syscalls; flush every 1s and/or every 1000 events.
// - Parent directory is created if missing.
// - A failed write reopens the file and tries once more.
//
// ENV: `RECORD_FILE=/path/to/events.jsonl` enables it (see main.rs).
//
use std::io;
use std::path::Path;

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;

/// Cloneable handle the engines write through. A disabled journal drops
/// everything; a full channel drops with a warning.
#[derive(Clone, Default)]
pub struct Journal {
    tx: Option<mpsc::Sender<Event>>,
}

impl Journal {
    pub fn disabled() -> Self { Self { tx: None } }

    pub fn new(tx: mpsc::Sender<Event>) -> Self { Self { tx: Some(tx) } }

    pub fn record(&self, ev: Event) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(ev) {
                warn!(err = %e, "journal: event dropped");
            }
        }
    }
}

async fn open_writer(path: &str) -> io::Result<BufWriter<fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(writer: &mut BufWriter<fs::File>, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let mut writer = match open_writer(&path).await {
        Ok(w) => Some(w),
        Err(e) => {
            error!(?e, %path, "recorder: open failed, journal disabled");
            None
        }
    };
    info!(%path, "recorder: started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_last_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let Some(w) = writer.as_mut() else { continue };
                let line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };

                if let Err(e) = write_line(w, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(mut fresh) => {
                            if let Err(e2) = write_line(&mut fresh, &line).await {
                                error!(?e2, "recorder: write failed again after reopen, drop event");
                            }
                            writer = Some(fresh);
                        }
                        Err(e2) => error!(?e2, "recorder: reopen failed, drop event"),
                    }
                }

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_EVENTS {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                if let Some(w) = writer.as_mut() {
                    let _ = w.flush().await;
                }
                since_last_flush = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = std::env::temp_dir().join(format!("perp_revert_rec_{}", std::process::id()));
        let path = dir.join("events.jsonl");
        let _ = std::fs::remove_file(&path);

        let (tx, rx) = mpsc::channel(16);
        let journal = Journal::new(tx);
        journal.record(Event::Note("boot".into()));
        journal.record(Event::Note("shutdown".into()));
        drop(journal);
        run(rx, path.to_string_lossy().into_owned()).await;

        let body = std::fs::read_to_string(&path).expect("journal file");
        let lines: Vec<_> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("boot"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn disabled_journal_swallows_events() {
        Journal::disabled().record(Event::Note("ignored".into()));
    }
}
