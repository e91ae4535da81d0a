use log::debug;
use tokio::sync::mpsc;

use crate::domain::problem::ProblemRecord;

/// Hands newly discovered problems to whoever posts announcements.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<ProblemRecord>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProblemRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify_problem(&self, record: ProblemRecord) {
        if self.tx.send(record).is_err() {
            debug!("announcement receiver gone; dropping notification");
        }
    }
}
