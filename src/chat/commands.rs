use chrono::NaiveTime;
use std::sync::Arc;

use crate::chat::chunk::{MAX_MESSAGE_CHARS, chunk_lines, chunk_text};
use crate::daemon::{ScanReason, ScanTrigger};
use crate::domain::problem::{ProblemNumber, ProblemRecord};
use crate::store::cache::ProblemCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Update,
    Help,
    Problem(ProblemNumber),
    /// Empty or unrecognised command.
    Usage,
}

/// Parse a chat message. `None` when it is not addressed to the bot.
pub fn parse(content: &str, prefix: &str) -> Option<Command> {
    let rest = content.trim_start().strip_prefix(prefix)?;
    let word = rest.trim();

    let cmd = match word.to_ascii_lowercase().as_str() {
        "list" => Command::List,
        "update" => Command::Update,
        "help" => Command::Help,
        w if !w.is_empty() && w.bytes().all(|b| b.is_ascii_digit()) => match w.parse() {
            Ok(n) => Command::Problem(n),
            Err(_) => Command::Usage,
        },
        _ => Command::Usage,
    };
    Some(cmd)
}

/// Where `update` requests go.
pub trait UpdateRequester: Send + Sync {
    fn request_update(&self);
}

impl UpdateRequester for ScanTrigger {
    fn request_update(&self) {
        self.fire(ScanReason::Manual);
    }
}

/// Turns commands into reply messages, each within the chat size limit.
pub struct CommandHandler {
    cache: Arc<ProblemCache>,
    updates: Arc<dyn UpdateRequester>,
    prefix: String,
    daily_update: NaiveTime,
}

impl CommandHandler {
    pub fn new(
        cache: Arc<ProblemCache>,
        updates: Arc<dyn UpdateRequester>,
        prefix: impl Into<String>,
        daily_update: NaiveTime,
    ) -> Self {
        Self {
            cache,
            updates,
            prefix: prefix.into(),
            daily_update,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn handle(&self, cmd: &Command) -> Vec<String> {
        match cmd {
            Command::List => self.list(),
            Command::Update => {
                self.updates.request_update();
                vec![
                    "Updating cache with the latest emails. This may take a few moments."
                        .to_string(),
                ]
            }
            Command::Help => vec![self.help()],
            Command::Problem(n) => match self.cache.get(*n) {
                Some(problem) => render_problem(&problem),
                None => {
                    let mut out = vec![format!(
                        "Problem number {n} is invalid or not available, get available problems with `{}list`.",
                        self.prefix
                    )];
                    out.extend(self.list());
                    out
                }
            },
            Command::Usage => vec![format!(
                "Please specify a command: {p}list, {p}update, {p}help, or {p}<number>",
                p = self.prefix
            )],
        }
    }

    fn list(&self) -> Vec<String> {
        let problems = self.cache.list();
        if problems.is_empty() {
            return vec![format!(
                "No problems cached yet. Try `{}update`.",
                self.prefix
            )];
        }
        let lines = problems
            .iter()
            .map(|p| format!("{}: {}", p.problem_number, p.subject));
        chunk_lines(lines, MAX_MESSAGE_CHARS)
    }

    fn help(&self) -> String {
        let p = &self.prefix;
        format!(
            "Daily Coding Problem Bot Commands:\n\
             `{p}list`: Lists all available coding problems.\n\
             `{p}<number>`: Displays the specific coding problem by number.\n\
             `{p}update`: Manually updates the cache with the latest problems.\n\
             Daily Update: The bot automatically updates the cache every day at {}.",
            self.daily_update.format("%H:%M")
        )
    }
}

/// Subject, blank line, body.
pub fn render_problem(problem: &ProblemRecord) -> Vec<String> {
    chunk_text(
        &format!("{}\n\n{}", problem.subject, problem.body),
        MAX_MESSAGE_CHARS,
    )
}

/// Announcement of a newly discovered problem: the body in a code block when
/// it fits in one message, plain chunks otherwise.
pub fn render_announcement(problem: &ProblemRecord) -> Vec<String> {
    let fenced = format!("{}\n```\n{}\n```", problem.subject, problem.body);
    if fenced.chars().count() <= MAX_MESSAGE_CHARS {
        vec![fenced]
    } else {
        render_problem(problem)
    }
}
