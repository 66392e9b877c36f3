use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::record::{Delivery, MessageRecord};

/// How many characters of rendered message fit on one diagram line.
const WRAP_COLUMNS: usize = 24;
/// Longest rendered body, in lines, before it is cut with an ellipsis.
const MAX_LINES: usize = 10;
/// Below this detection confidence the message falls back to lossy UTF-8.
const CONFIDENCE_THRESHOLD: f32 = 0.8;

/// Append-only sink producing a Mermaid-dialect sequence diagram.
///
/// One `A->>B: text` (or `A-xB: text`) line per forward attempt, with an
/// optional `Note over A,B: label` annotation. The `_Actual` suffix is
/// stripped so the diagram shows logical hosts.
pub struct DiagramWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl DiagramWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_owned(),
            file: Mutex::new(file),
        })
    }

    /// Record one forward attempt. Write failures are logged, never raised;
    /// the diagram is an observability sink and must not take a flow down
    /// with it.
    pub fn append(&self, record: &MessageRecord, status: Delivery) {
        let sender = record.sender.replace("_Actual", "");
        let recipient = record.recipient.replace("_Actual", "");

        let arrow = match status {
            Delivery::Success => "->>",
            Delivery::Dropped | Delivery::Failure | Delivery::RouterError => "-x",
        };

        let text = render_message(&record.message);
        let lines = wrap(&text);

        let mut out = String::new();
        if lines.len() <= 1 {
            out.push_str(&format!("{sender}{arrow}{recipient}: {text}\n"));
        } else {
            out.push_str(&format!(
                "{sender}{arrow}{recipient}: {}\n",
                lines.join("<br>")
            ));
        }

        if let Some(label) = record.diagram_label.as_deref() {
            if !label.trim().is_empty() {
                out.push_str(&format!("Note over {sender},{recipient}: {label}\n"));
            }
        }

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = file.write_all(out.as_bytes()).and_then(|()| file.flush()) {
            tracing::warn!(path = %self.path.display(), "failed to append to sequence diagram: {e}");
        }
    }
}

/// Decode message bytes for human display: sniff the charset, trust the
/// sniffer above the confidence threshold, otherwise decode as lossy UTF-8.
fn render_message(message: &[u8]) -> String {
    let (charset, confidence, _language) = chardet::detect(message);

    if confidence > CONFIDENCE_THRESHOLD {
        let label = chardet::charset2encoding(&charset);
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) {
            let (decoded, _, _) = encoding.decode(message);
            return decoded.into_owned();
        }
        tracing::debug!(%charset, "detected charset has no decoder, using lossy utf-8");
    } else {
        tracing::debug!(
            %charset,
            %confidence,
            "low confidence in detected charset, using lossy utf-8"
        );
    }

    String::from_utf8_lossy(message).into_owned()
}

/// Split into chunks of [`WRAP_COLUMNS`] characters, at most [`MAX_LINES`]
/// of them, with a trailing ellipsis when the text was cut.
fn wrap(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();

    let mut lines: Vec<String> = chars
        .chunks(WRAP_COLUMNS)
        .take(MAX_LINES)
        .map(|chunk| chunk.iter().collect())
        .collect();

    if chars.len() > WRAP_COLUMNS * MAX_LINES {
        lines.push("...".to_owned());
    }

    lines
}
