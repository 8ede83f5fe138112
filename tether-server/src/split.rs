//! Splitting of outgoing message bodies into wire-sized pieces.

/// Longest body, in characters, sent as a single line.
pub const LINE_BUDGET: usize = 250;

/// One piece of a split body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub text: String,
    /// What sat between this piece and the next one in the original body:
    /// `"\n"` or `" "` when a separator was consumed, empty otherwise.
    pub joiner: &'static str,
}

/// Split `body` into the texts to send, in order.
pub fn all(body: &str) -> Vec<String> {
    pieces(body).into_iter().map(|p| p.text).collect()
}

/// Split `body`, keeping track of consumed separators.
///
/// A body containing a newline is split on newlines only. Otherwise, while
/// the remainder exceeds [`LINE_BUDGET`], it breaks at the last space in the
/// window (dropping it), else just after the last `-`, `.` or `,`, else
/// hard at the budget.
pub fn pieces(body: &str) -> Vec<Piece> {
    if body.contains('\n') {
        let lines: Vec<&str> = body.split('\n').collect();
        let last = lines.len() - 1;
        return lines
            .into_iter()
            .enumerate()
            .map(|(i, line)| Piece {
                text: line.to_string(),
                joiner: if i == last { "" } else { "\n" },
            })
            .collect();
    }

    let mut out = Vec::new();
    let mut rest = body;
    while rest.chars().count() > LINE_BUDGET {
        let (head, tail, joiner) = break_line(rest);
        out.push(Piece {
            text: head.to_string(),
            joiner,
        });
        rest = tail;
    }
    out.push(Piece {
        text: rest.to_string(),
        joiner: "",
    });
    out
}

/// Reassemble pieces produced by [`pieces`].
pub fn rejoin(pieces: &[Piece]) -> String {
    pieces.iter().map(|p| format!("{}{}", p.text, p.joiner)).collect()
}

fn break_line(line: &str) -> (&str, &str, &'static str) {
    // Byte offset just past the first LINE_BUDGET characters.
    let window_end = line
        .char_indices()
        .nth(LINE_BUDGET)
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    let window = &line[..window_end];

    if let Some(space) = window.rfind(' ') {
        return (&line[..space], &line[space + 1..], " ");
    }
    if let Some(punct) = window.rfind(['-', '.', ',']) {
        return (&line[..=punct], &line[punct + 1..], "");
    }
    (window, &line[window_end..], "")
}
