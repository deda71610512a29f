// Typed metrics buckets - one shape per operation type, cursor-paged
//
// Training operations log per-epoch metrics and maintain a derived trend
// (best-so-far, plateau, overfit). Data loads log filled segments, backtests
// log walk-forward windows, everything else keeps raw JSON items. All
// buckets are append-only so a cursor is just an offset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::types::OperationType;

/// No improvement for this many epochs counts as a plateau.
const PLATEAU_WINDOW: u32 = 5;
/// Validation loss rising while training loss falls over this many epochs
/// counts as overfitting.
const OVERFIT_WINDOW: usize = 3;

/// One completed training epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetric {
    pub epoch: u32,
    pub train_loss: f64,
    pub val_loss: Option<f64>,
    pub accuracy: Option<f64>,
    pub learning_rate: Option<f64>,
    pub duration_ms: Option<u64>,
}

/// One filled data segment (gap-fill or bulk load).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMetric {
    pub symbol: Option<String>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub rows: u64,
    pub source: Option<String>,
}

/// One walk-forward backtest window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowMetric {
    pub window: u32,
    pub pnl: f64,
    pub trades: u64,
    pub win_rate: Option<f64>,
}

/// Derived view over the epoch log, recomputed on every training append.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingTrend {
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<u32>,
    pub epochs_since_improvement: u32,
    pub plateau: bool,
    pub overfitting: bool,
}

/// Compact digest carried on the operation record. The full item history is
/// served through cursor paging only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MetricsSummary {
    #[default]
    None,
    Training {
        epochs_recorded: usize,
        trend: TrainingTrend,
    },
    DataLoad {
        segments_recorded: usize,
        rows_total: u64,
    },
    Backtest {
        windows_recorded: usize,
    },
    Generic {
        items_recorded: usize,
    },
}

/// A page of metric items appended since the caller's cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsPage {
    pub items: Vec<Value>,
    pub next_cursor: u64,
}

impl MetricsPage {
    pub fn empty(cursor: u64) -> Self {
        Self {
            items: Vec::new(),
            next_cursor: cursor,
        }
    }
}

/// Append-only metrics store keyed by operation type.
#[derive(Debug, Clone)]
pub enum MetricsLog {
    Training {
        epochs: Vec<EpochMetric>,
        trend: TrainingTrend,
    },
    DataLoad {
        segments: Vec<SegmentMetric>,
    },
    Backtest {
        windows: Vec<WindowMetric>,
    },
    Generic {
        items: Vec<Value>,
    },
}

impl MetricsLog {
    pub fn for_type(op_type: OperationType) -> Self {
        match op_type {
            OperationType::Training => MetricsLog::Training {
                epochs: Vec::new(),
                trend: TrainingTrend::default(),
            },
            OperationType::DataLoad => MetricsLog::DataLoad {
                segments: Vec::new(),
            },
            OperationType::Backtest => MetricsLog::Backtest {
                windows: Vec::new(),
            },
            OperationType::Indicator | OperationType::Other => MetricsLog::Generic {
                items: Vec::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetricsLog::Training { epochs, .. } => epochs.len(),
            MetricsLog::DataLoad { segments } => segments.len(),
            MetricsLog::Backtest { windows } => windows.len(),
            MetricsLog::Generic { items } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Type-aware ingestion. Items that do not parse into the bucket's shape
    /// are skipped with a warning; they never corrupt the log. Returns the
    /// number of items accepted.
    pub fn append(&mut self, incoming: Vec<Value>) -> usize {
        let mut accepted = 0;
        match self {
            MetricsLog::Training { epochs, trend } => {
                for item in incoming {
                    match serde_json::from_value::<EpochMetric>(item) {
                        Ok(epoch) => {
                            epochs.push(epoch);
                            accepted += 1;
                        }
                        Err(err) => warn!("Skipping malformed epoch metric: {}", err),
                    }
                }
                if accepted > 0 {
                    *trend = recompute_trend(epochs);
                }
            }
            MetricsLog::DataLoad { segments } => {
                for item in incoming {
                    match serde_json::from_value::<SegmentMetric>(item) {
                        Ok(segment) => {
                            segments.push(segment);
                            accepted += 1;
                        }
                        Err(err) => warn!("Skipping malformed segment metric: {}", err),
                    }
                }
            }
            MetricsLog::Backtest { windows } => {
                for item in incoming {
                    match serde_json::from_value::<WindowMetric>(item) {
                        Ok(window) => {
                            windows.push(window);
                            accepted += 1;
                        }
                        Err(err) => warn!("Skipping malformed window metric: {}", err),
                    }
                }
            }
            MetricsLog::Generic { items } => {
                accepted = incoming.len();
                items.extend(incoming);
            }
        }
        accepted
    }

    /// Items appended since `cursor`. `next_cursor` always equals the log
    /// length, so a caller that was up to date gets an empty page with its
    /// cursor unchanged. Deterministic for identical log state and cursor.
    pub fn page(&self, cursor: u64) -> MetricsPage {
        let len = self.len() as u64;
        let start = cursor.min(len) as usize;
        let items = match self {
            MetricsLog::Training { epochs, .. } => {
                epochs[start..].iter().map(to_value_lossy).collect()
            }
            MetricsLog::DataLoad { segments } => {
                segments[start..].iter().map(to_value_lossy).collect()
            }
            MetricsLog::Backtest { windows } => {
                windows[start..].iter().map(to_value_lossy).collect()
            }
            MetricsLog::Generic { items } => items[start..].to_vec(),
        };
        MetricsPage {
            items,
            next_cursor: len,
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        match self {
            MetricsLog::Training { epochs, trend } => MetricsSummary::Training {
                epochs_recorded: epochs.len(),
                trend: trend.clone(),
            },
            MetricsLog::DataLoad { segments } => MetricsSummary::DataLoad {
                segments_recorded: segments.len(),
                rows_total: segments.iter().map(|s| s.rows).sum(),
            },
            MetricsLog::Backtest { windows } => MetricsSummary::Backtest {
                windows_recorded: windows.len(),
            },
            MetricsLog::Generic { items } => MetricsSummary::Generic {
                items_recorded: items.len(),
            },
        }
    }

    pub fn training_trend(&self) -> Option<&TrainingTrend> {
        match self {
            MetricsLog::Training { trend, .. } => Some(trend),
            _ => None,
        }
    }
}

fn to_value_lossy<T: Serialize>(item: &T) -> Value {
    serde_json::to_value(item).unwrap_or(Value::Null)
}

fn recompute_trend(epochs: &[EpochMetric]) -> TrainingTrend {
    // epochs without validation data fall back to training loss so the
    // trend still tracks something useful
    let mut best: Option<(usize, f64)> = None;
    for (idx, epoch) in epochs.iter().enumerate() {
        let loss = epoch.val_loss.unwrap_or(epoch.train_loss);
        match best {
            Some((_, best_loss)) if loss >= best_loss => {}
            _ => best = Some((idx, loss)),
        }
    }

    match best {
        Some((idx, loss)) => {
            let since = (epochs.len() - 1 - idx) as u32;
            TrainingTrend {
                best_val_loss: Some(loss),
                best_epoch: Some(epochs[idx].epoch),
                epochs_since_improvement: since,
                plateau: since >= PLATEAU_WINDOW,
                overfitting: is_overfitting(epochs),
            }
        }
        None => TrainingTrend::default(),
    }
}

fn is_overfitting(epochs: &[EpochMetric]) -> bool {
    if epochs.len() < OVERFIT_WINDOW {
        return false;
    }
    let tail = &epochs[epochs.len() - OVERFIT_WINDOW..];
    tail.windows(2).all(|pair| {
        match (pair[0].val_loss, pair[1].val_loss) {
            (Some(prev_val), Some(next_val)) => {
                next_val > prev_val && pair[1].train_loss < pair[0].train_loss
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn epoch(n: u32, train: f64, val: f64) -> Value {
        json!({ "epoch": n, "train_loss": train, "val_loss": val })
    }

    #[test]
    fn test_training_append_tracks_best_epoch() {
        let mut log = MetricsLog::for_type(OperationType::Training);
        log.append(vec![epoch(1, 0.9, 0.8), epoch(2, 0.7, 0.6), epoch(3, 0.6, 0.65)]);

        let trend = log.training_trend().unwrap();
        assert_eq!(trend.best_val_loss, Some(0.6));
        assert_eq!(trend.best_epoch, Some(2));
        assert_eq!(trend.epochs_since_improvement, 1);
        assert!(!trend.plateau);
    }

    #[test]
    fn test_plateau_after_stale_epochs() {
        let mut log = MetricsLog::for_type(OperationType::Training);
        log.append(vec![epoch(1, 0.9, 0.5)]);
        for n in 2..=6 {
            log.append(vec![epoch(n, 0.9 - n as f64 * 0.01, 0.55)]);
        }

        let trend = log.training_trend().unwrap();
        assert_eq!(trend.epochs_since_improvement, 5);
        assert!(trend.plateau);
    }

    #[test]
    fn test_overfit_detection() {
        let mut log = MetricsLog::for_type(OperationType::Training);
        // training loss keeps falling while validation loss climbs
        log.append(vec![
            epoch(1, 0.50, 0.40),
            epoch(2, 0.40, 0.45),
            epoch(3, 0.30, 0.50),
            epoch(4, 0.20, 0.55),
        ]);

        let trend = log.training_trend().unwrap();
        assert!(trend.overfitting);
        assert_eq!(trend.best_epoch, Some(1));
    }

    #[test]
    fn test_malformed_items_are_skipped() {
        let mut log = MetricsLog::for_type(OperationType::Training);
        let accepted = log.append(vec![epoch(1, 0.5, 0.4), json!({ "not": "an epoch" })]);
        assert_eq!(accepted, 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_page_returns_only_new_items() {
        let mut log = MetricsLog::for_type(OperationType::Training);
        log.append(vec![epoch(1, 0.9, 0.8), epoch(2, 0.8, 0.7)]);

        let first = log.page(0);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor, 2);

        log.append(vec![epoch(3, 0.7, 0.6)]);
        let second = log.page(first.next_cursor);
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.next_cursor, 3);
    }

    #[test]
    fn test_page_with_no_new_data_keeps_cursor() {
        let mut log = MetricsLog::for_type(OperationType::DataLoad);
        log.append(vec![json!({ "rows": 1000, "symbol": "BTCUSDT" })]);

        let page = log.page(1);
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, 1);
    }

    #[test]
    fn test_page_is_deterministic() {
        let mut log = MetricsLog::for_type(OperationType::Backtest);
        log.append(vec![
            json!({ "window": 1, "pnl": 120.5, "trades": 14 }),
            json!({ "window": 2, "pnl": -30.0, "trades": 9 }),
        ]);

        let a = log.page(0);
        let b = log.page(0);
        assert_eq!(a.items, b.items);
        assert_eq!(a.next_cursor, b.next_cursor);
    }

    #[test]
    fn test_data_load_summary_sums_rows() {
        let mut log = MetricsLog::for_type(OperationType::DataLoad);
        log.append(vec![
            json!({ "rows": 1000 }),
            json!({ "rows": 500, "symbol": "ETHUSDT" }),
        ]);

        match log.summary() {
            MetricsSummary::DataLoad {
                segments_recorded,
                rows_total,
            } => {
                assert_eq!(segments_recorded, 2);
                assert_eq!(rows_total, 1500);
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[test]
    fn test_generic_bucket_keeps_raw_items() {
        let mut log = MetricsLog::for_type(OperationType::Other);
        let accepted = log.append(vec![json!({ "anything": true })]);
        assert_eq!(accepted, 1);
        assert_eq!(log.page(0).items, vec![json!({ "anything": true })]);
    }
}
