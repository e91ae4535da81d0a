pub type ProblemNumber = u32;

/// A message as fetched from the mailbox, before any parsing.
#[derive(Debug, Clone)]
pub struct RawEmail {
    pub id: String,
    pub subject: String,
    /// Full RFC 822 message (headers + MIME parts).
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemRecord {
    pub problem_number: ProblemNumber,
    pub subject: String,
    pub body: String,
    pub source_message_id: String,
}
