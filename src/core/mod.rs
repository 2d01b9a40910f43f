pub mod checkpoint;
pub mod comparator;
pub mod conflict;
pub mod engine;
pub mod progress;
pub mod report;
pub mod retry;
pub mod scanner;
pub mod transfer;
pub mod verify;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use comparator::{discover, FileComparator, ItemStatus, Manifest, ManifestItem, ManifestSummary};
pub use conflict::{AgentDecision, AgentDecisions, ConflictResolver, ConflictStrategy, Decision};
pub use engine::{JobOutcome, RunOptions, SyncEngine};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use report::{build_report, Report, ReportWriter};
pub use retry::{Clock, RetryPolicy, TokioClock};
pub use scanner::{FileScanner, ScanConfig};
pub use transfer::{TransferAction, TransferExecutor, TransferOptions, TransferResult, TransferSummary};
pub use verify::{VerificationItem, VerificationReport, Verifier};
