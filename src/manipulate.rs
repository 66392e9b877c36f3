use crate::record::MessageRecord;

/// The instructor extension point.
///
/// Called exactly once per record, inline on the receiving task, between
/// creation and queue commit. Implementations may reschedule
/// (`forward_time`), drop, relabel or rewrite the message. They must not
/// block: a delay is expressed through `forward_time`, never by sleeping.
/// Rewriting `sender`, `recipient`, the ports or the socket is outside the
/// contract and the forwarder promises nothing sensible for it.
pub trait Manipulate: Send + Sync + 'static {
    fn manipulate(&self, record: MessageRecord) -> MessageRecord;
}

/// Default hook; forwards every record untouched.
pub struct Identity;

impl Manipulate for Identity {
    fn manipulate(&self, record: MessageRecord) -> MessageRecord {
        record
    }
}

impl<F> Manipulate for F
where
    F: Fn(MessageRecord) -> MessageRecord + Send + Sync + 'static,
{
    fn manipulate(&self, record: MessageRecord) -> MessageRecord {
        (self)(record)
    }
}

/// Ready-made hooks for common test manipulations.
pub mod hooks {
    use std::sync::Mutex;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng as _, SeedableRng as _};

    use super::Manipulate;
    use crate::record::MessageRecord;

    /// Suppresses delivery of every message whose bytes equal `needle`.
    pub struct DropMatching {
        needle: Vec<u8>,
    }

    impl DropMatching {
        pub fn new(needle: impl Into<Vec<u8>>) -> Self {
            Self {
                needle: needle.into(),
            }
        }
    }

    impl Manipulate for DropMatching {
        fn manipulate(&self, mut record: MessageRecord) -> MessageRecord {
            if record.message == self.needle {
                record.drop_message = true;
            }
            record
        }
    }

    /// Delays every message whose bytes equal `needle` by a fixed duration.
    pub struct DelayMatching {
        needle: Vec<u8>,
        delay: Duration,
    }

    impl DelayMatching {
        pub fn new(needle: impl Into<Vec<u8>>, delay: Duration) -> Self {
            Self {
                needle: needle.into(),
                delay,
            }
        }
    }

    impl Manipulate for DelayMatching {
        fn manipulate(&self, mut record: MessageRecord) -> MessageRecord {
            if record.message == self.needle {
                record.delay_by(self.delay);
            }
            record
        }
    }

    /// Attaches a diagram label to every message whose bytes equal `needle`.
    pub struct LabelMatching {
        needle: Vec<u8>,
        label: String,
    }

    impl LabelMatching {
        pub fn new(needle: impl Into<Vec<u8>>, label: impl Into<String>) -> Self {
            Self {
                needle: needle.into(),
                label: label.into(),
            }
        }
    }

    impl Manipulate for LabelMatching {
        fn manipulate(&self, mut record: MessageRecord) -> MessageRecord {
            if record.message == self.needle {
                record.diagram_label = Some(self.label.clone());
            }
            record
        }
    }

    /// Delays every message by a uniformly random duration up to `max`.
    ///
    /// Seeded, so a grading run can be replayed: the same seed yields the
    /// same delay sequence.
    pub struct RandomDelay {
        max: Duration,
        rng: Mutex<StdRng>,
    }

    impl RandomDelay {
        pub fn new(max: Duration, seed: u64) -> Self {
            Self {
                max,
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }
        }
    }

    impl Manipulate for RandomDelay {
        fn manipulate(&self, mut record: MessageRecord) -> MessageRecord {
            let delay = {
                let mut rng = self.rng.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                rng.gen_range(Duration::ZERO..=self.max)
            };
            record.delay_by(delay);
            record
        }
    }
}
