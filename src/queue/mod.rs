//! Instruction queue
//!
//! Serializes everything sent to the printer: instructions leave in
//! enqueue order and at most one is in flight at any time. A dispatcher
//! task writes the head once the link is open and then waits for one of:
//!
//! - a verdict line claimed through the [`LineRouter`] (acknowledgment,
//!   completion pattern or rejection),
//! - the instruction's deadline,
//! - the link failing or being replaced,
//! - shutdown.
//!
//! Whatever happens, the head is retired with a terminal status before the
//! next one is considered. Nothing is retried automatically; a caller that
//! sees `TimedOut` decides whether to enqueue again.
//!
//! When the verdict came from a line other than `ok` (a completion pattern
//! or a rejection), the printer still sends its usual `ok` afterwards. The
//! dispatcher waits briefly for it so it cannot be mistaken for the next
//! instruction's acknowledgment.

mod instruction;

pub use instruction::{InstructionHandle, InstructionOutcome, InstructionSpec, InstructionStatus};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, QueueSettings};
use crate::error::{BridgeError, BridgeResult};
use crate::router::{literal_regex, LineConsumer, LineRouter};
use crate::shutdown::Shutdown;
use crate::transport::{LinkStatus, Transport};
use instruction::{is_ack, Instruction};

/// Runtime settings of the queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deadline for instructions that do not set their own
    pub instruction_timeout: Duration,
    /// Lines marking the in-flight instruction as rejected
    pub rejection_patterns: Vec<Regex>,
    /// Wait for the `ok` that follows a verdict carried by another line
    pub rejection_ack_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            instruction_timeout: Duration::from_secs(10),
            rejection_patterns: vec![literal_regex("(Unknown command)")],
            rejection_ack_grace: Duration::from_secs(1),
        }
    }
}

impl TryFrom<&QueueSettings> for QueueConfig {
    type Error = ConfigError;

    fn try_from(settings: &QueueSettings) -> Result<Self, Self::Error> {
        Ok(Self {
            instruction_timeout: Duration::from_millis(settings.instruction_timeout_ms),
            rejection_patterns: settings.compiled_rejection_patterns()?,
            rejection_ack_grace: Duration::from_millis(settings.rejection_ack_grace_ms),
        })
    }
}

#[derive(Default)]
struct QueueInner {
    /// Head is the in-flight instruction or the next to send.
    pending: VecDeque<Arc<Instruction>>,
    in_flight: Option<Arc<Instruction>>,
    next_id: u64,
}

/// FIFO of printer instructions with a single dispatcher.
pub struct InstructionQueue {
    inner: Mutex<QueueInner>,
    work: Notify,
    transport: Arc<Transport>,
    config: QueueConfig,
    shutdown: Shutdown,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InstructionQueue {
    /// Create the queue, claim the router's matcher slot and start the
    /// dispatcher.
    pub fn start(
        transport: Arc<Transport>,
        router: &LineRouter,
        config: QueueConfig,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            work: Notify::new(),
            transport,
            config,
            shutdown,
            dispatcher: Mutex::new(None),
        });

        let matcher: Arc<dyn LineConsumer> = queue.clone();
        router.set_instruction_matcher(Arc::downgrade(&matcher));

        let task = tokio::spawn(Arc::clone(&queue).dispatch_loop());
        *queue.dispatcher.lock() = Some(task);
        queue
    }

    /// Append an instruction completed by a generic acknowledgment, or by
    /// `completion` when given.
    pub fn enqueue(&self, text: impl Into<String>, completion: Option<Regex>) -> InstructionHandle {
        let mut spec = InstructionSpec::new(text);
        spec.completion = completion;
        self.enqueue_with(spec)
    }

    /// Append an instruction described by `spec`.
    pub fn enqueue_with(&self, spec: InstructionSpec) -> InstructionHandle {
        let instruction = {
            let mut inner = self.inner.lock();
            let instruction = self.allocate(&mut inner, spec);
            inner.pending.push_back(Arc::clone(&instruction));
            instruction
        };
        tracing::trace!(id = instruction.id(), text = %instruction.text(), "Enqueued instruction");
        self.work.notify_one();
        InstructionHandle::new(instruction, self.shutdown.clone())
    }

    /// Append several plain instructions as one contiguous run.
    pub fn enqueue_list<I, S>(&self, texts: I) -> Vec<InstructionHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let instructions: Vec<Arc<Instruction>> = {
            let mut inner = self.inner.lock();
            texts
                .into_iter()
                .map(|text| {
                    let instruction = self.allocate(&mut inner, InstructionSpec::new(text));
                    inner.pending.push_back(Arc::clone(&instruction));
                    instruction
                })
                .collect()
        };
        self.work.notify_one();
        instructions
            .into_iter()
            .map(|instruction| InstructionHandle::new(instruction, self.shutdown.clone()))
            .collect()
    }

    /// Enqueue and wait for the terminal outcome.
    ///
    /// With a `deadline`, gives up waiting with
    /// [`BridgeError::InstructionTimeout`]; the instruction stays queued.
    pub async fn enqueue_and_wait(
        &self,
        text: impl Into<String>,
        completion: Option<Regex>,
        deadline: Option<Duration>,
    ) -> BridgeResult<InstructionOutcome> {
        let handle = self.enqueue(text, completion);
        match deadline {
            Some(deadline) => handle.wait_timeout(deadline).await,
            None => handle.wait().await,
        }
    }

    /// Number of instructions not yet retired.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the instruction awaiting its verdict.
    pub fn in_flight(&self) -> Option<u64> {
        self.inner.lock().in_flight.as_ref().map(|i| i.id())
    }

    /// Id and status of every queued instruction, head first.
    pub fn statuses(&self) -> Vec<(u64, InstructionStatus)> {
        self.inner
            .lock()
            .pending
            .iter()
            .map(|i| (i.id(), i.status()))
            .collect()
    }

    /// Wait for the dispatcher to exit. Shutdown must already be triggered
    /// (or be triggered by someone else).
    pub async fn stop(&self) {
        let task = self.dispatcher.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Instruction dispatcher ended abnormally");
            }
        }
        // Anything left behind will never be sent.
        let leftovers: Vec<_> = self.inner.lock().pending.drain(..).collect();
        for instruction in leftovers {
            instruction.time_out();
        }
    }

    fn allocate(&self, inner: &mut QueueInner, spec: InstructionSpec) -> Arc<Instruction> {
        inner.next_id += 1;
        Arc::new(Instruction::new(
            inner.next_id,
            spec,
            self.config.instruction_timeout,
        ))
    }

    fn rejection_token(&self, line: &str) -> Option<String> {
        self.config.rejection_patterns.iter().find_map(|pattern| {
            pattern.captures(line).map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
        })
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut link = self.transport.link_status();
        while let Some(head) = self.next_head().await {
            let Some(generation) = self.wait_for_link(&mut link).await else {
                break;
            };
            self.dispatch(&head, generation, &mut link).await;
            self.retire(&head);
        }
        tracing::debug!("Instruction dispatcher stopped");
    }

    async fn next_head(&self) -> Option<Arc<Instruction>> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            if let Some(head) = self.inner.lock().pending.front().cloned() {
                return Some(head);
            }
            tokio::select! {
                _ = self.work.notified() => {}
                _ = self.shutdown.wait() => return None,
            }
        }
    }

    async fn wait_for_link(&self, link: &mut watch::Receiver<LinkStatus>) -> Option<u64> {
        let open = async {
            link.wait_for(LinkStatus::is_open)
                .await
                .map(|status| status.generation)
        };
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => None,
            generation = open => generation.ok(),
        }
    }

    async fn dispatch(
        &self,
        head: &Arc<Instruction>,
        generation: u64,
        link: &mut watch::Receiver<LinkStatus>,
    ) {
        {
            let mut inner = self.inner.lock();
            head.mark_sent();
            inner.in_flight = Some(Arc::clone(head));
        }
        tracing::debug!(id = head.id(), text = %head.text(), "Dispatching instruction");

        match self.transport.send_once(&head.wire_bytes()).await {
            Ok(()) => self.await_verdict(head, generation, link).await,
            Err(BridgeError::ShuttingDown) => {
                head.time_out();
            }
            Err(e) => {
                tracing::warn!(id = head.id(), error = %e, "Instruction was not delivered");
                head.time_out();
            }
        }
    }

    async fn await_verdict(
        &self,
        head: &Arc<Instruction>,
        generation: u64,
        link: &mut watch::Receiver<LinkStatus>,
    ) {
        let mut outcome = head.subscribe();
        let verdict = async {
            outcome
                .wait_for(|o| o.status.is_terminal())
                .await
                .map(|o| o.status)
        };
        let link_lost = async {
            let _ = link
                .wait_for(|status| !status.is_open() || status.generation != generation)
                .await;
        };

        tokio::select! {
            biased;
            status = verdict => {
                if status.is_ok() && head.owes_ack() {
                    self.await_trailing_ack(head).await;
                }
            }
            _ = link_lost => {
                if head.time_out() {
                    tracing::warn!(
                        id = head.id(),
                        text = %head.text(),
                        "Serial link failed before the printer answered"
                    );
                }
            }
            _ = tokio::time::sleep(head.timeout()) => {
                if head.time_out() {
                    tracing::warn!(
                        id = head.id(),
                        text = %head.text(),
                        timeout = ?head.timeout(),
                        "Instruction timed out"
                    );
                }
            }
            _ = self.shutdown.wait() => {
                head.time_out();
            }
        }
    }

    async fn await_trailing_ack(&self, head: &Instruction) {
        tokio::select! {
            _ = head.trailing_ack() => {}
            _ = tokio::time::sleep(self.config.rejection_ack_grace) => {
                tracing::debug!(id = head.id(), "No acknowledgment after the verdict");
            }
            _ = self.shutdown.wait() => {}
        }
    }

    fn retire(&self, head: &Arc<Instruction>) {
        let mut inner = self.inner.lock();
        inner.in_flight = None;
        if inner
            .pending
            .front()
            .is_some_and(|front| Arc::ptr_eq(front, head))
        {
            inner.pending.pop_front();
        }
        tracing::trace!(id = head.id(), status = ?head.status(), "Retired instruction");
    }
}

impl LineConsumer for InstructionQueue {
    fn consume(&self, line: &str) -> bool {
        let Some(head) = self.inner.lock().in_flight.clone() else {
            return false;
        };

        match head.status() {
            InstructionStatus::Sent => {}
            _ if is_ack(line) && head.owes_ack() => {
                head.note_trailing_ack();
                return true;
            }
            _ => return false,
        }

        match head.completion() {
            Some(pattern) => {
                if let Some(caps) = pattern.captures(line) {
                    return head.confirm(line, Some(&caps));
                }
            }
            None => {
                if is_ack(line) {
                    return head.confirm(line, None);
                }
            }
        }

        if let Some(token) = self.rejection_token(line) {
            tracing::warn!(
                id = head.id(),
                text = %head.text(),
                token = %token,
                "Printer rejected instruction"
            );
            return head.reject(line, token);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_detection() {
        assert!(is_ack("ok"));
        assert!(is_ack("ok T:210.0 /210.0 B:60.0 /60.0"));
        assert!(!is_ack("okay"));
        assert!(!is_ack("echo:ok"));
    }

    #[test]
    fn test_queue_config_from_settings() {
        let settings = QueueSettings {
            rejection_patterns: vec!["^Error:(.*)".to_string(), "Unknown command".to_string()],
            ..QueueSettings::default()
        };
        let config = QueueConfig::try_from(&settings).unwrap();
        assert_eq!(config.rejection_patterns.len(), 2);
        assert_eq!(config.instruction_timeout, Duration::from_secs(10));

        let bad = QueueSettings {
            rejection_patterns: vec!["(".to_string()],
            ..QueueSettings::default()
        };
        assert!(QueueConfig::try_from(&bad).is_err());
    }
}
