/// Read position of one stream inside a consumer group.
///
/// A fresh consumer starts every stream in `Backlog("0-0")`, which makes
/// `XREADGROUP` return entries already delivered to this consumer but not yet
/// acknowledged. Once a backlog read comes back empty the stream switches to
/// `LiveTail` and is never read from the backlog again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Backlog(String),
    LiveTail,
}

impl Cursor {
    pub const BACKLOG_START: &'static str = "0-0";
    pub const LIVE_TAIL: &'static str = ">";

    pub fn start() -> Self {
        Cursor::Backlog(Self::BACKLOG_START.to_string())
    }

    /// The id argument to pass to `XREADGROUP` for this cursor.
    pub fn as_id(&self) -> &str {
        match self {
            Cursor::Backlog(id) => id,
            Cursor::LiveTail => Self::LIVE_TAIL,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Cursor::LiveTail)
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start()
    }
}
