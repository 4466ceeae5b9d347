//! Blank-run optimization: collapse runs of all-zero print lines into feed
//! operations so the device moves paper instead of burning empty lines.

/// One logical print operation, ready for family-specific dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOp {
    /// Print one packed line.
    Draw(Vec<u8>),
    /// Advance the paper by this many blank lines.
    Feed(u16),
}

/// Output of [`collapse_blank_runs`]. A trailing blank run is never emitted
/// as an op: the caller decides whether to flush it before finishing or fold
/// it into the next item's leading offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    pub ops: Vec<LineOp>,
    pub trailing_feed: u16,
}

/// Single greedy pass over packed lines. A line is blank iff every byte is
/// zero; interleaving of draws and feeds is preserved exactly.
pub fn collapse_blank_runs<I>(lines: I) -> Plan
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut ops = Vec::new();
    let mut blank: u16 = 0;
    for line in lines {
        if line.iter().all(|&b| b == 0) {
            blank = blank.saturating_add(1);
        } else {
            if blank > 0 {
                ops.push(LineOp::Feed(blank));
                blank = 0;
            }
            ops.push(LineOp::Draw(line));
        }
    }
    Plan {
        ops,
        trailing_feed: blank,
    }
}
