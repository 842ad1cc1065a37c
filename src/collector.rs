use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeDelta};
use tracing::{info, warn};

use crate::apsystems::{DayReport, ReportSource};
use crate::influx::PointSink;
use crate::points::{ParseMode, Tags, build_day_batch};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub days_written: usize,
    pub days_skipped: usize,
    pub points_written: usize,
    pub readings_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// A single-day run got no data back from the portal.
    NoData(NaiveDate),
}

/// Days to fetch for the closed range `[days_back, days_back_to]`, nearest first.
pub fn days_to_fetch(today: NaiveDate, days_back: u32, days_back_to: u32) -> Vec<NaiveDate> {
    (days_back..=days_back_to)
        .map(|n| today - TimeDelta::days(i64::from(n)))
        .collect()
}

/// Fetch, shape and write every day in turn.
///
/// A single day is handled strictly: no data ends the run and a bad reading
/// fails it. A range is lenient: days without data and bad readings are
/// skipped. Fetch and write errors always abort; days already written stay.
pub async fn run<S, W>(source: &S, sink: &W, tags: &Tags, days: &[NaiveDate]) -> Result<RunOutcome>
where
    S: ReportSource,
    W: PointSink,
{
    let mode = if days.len() == 1 {
        ParseMode::Strict
    } else {
        ParseMode::Lenient
    };
    let mut summary = RunSummary::default();

    for &day in days {
        let report = match source
            .fetch(day)
            .await
            .with_context(|| format!("fetching report for {day}"))?
        {
            DayReport::Data(report) => report,
            DayReport::NoData if mode == ParseMode::Strict => return Ok(RunOutcome::NoData(day)),
            DayReport::NoData => {
                warn!(%day, "no data returned, skipping day");
                summary.days_skipped += 1;
                continue;
            }
        };

        let batch = build_day_batch(&report, tags, mode)
            .with_context(|| format!("converting report for {day}"))?;

        sink.write_points(&batch.points)
            .await
            .with_context(|| format!("writing points for {day}"))?;

        info!(
            %day,
            points = batch.points.len(),
            skipped = batch.skipped.len(),
            "day complete"
        );
        summary.days_written += 1;
        summary.points_written += batch.points.len();
        summary.readings_skipped += batch.skipped.len();
    }

    Ok(RunOutcome::Completed(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apsystems::{PortalError, RawReport};
    use crate::influx::WriteError;
    use crate::points::Point;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakePortal {
        reports: HashMap<NaiveDate, DayReport>,
        calls: RefCell<Vec<NaiveDate>>,
    }

    impl FakePortal {
        fn with(mut self, day: NaiveDate, report: DayReport) -> Self {
            self.reports.insert(day, report);
            self
        }
    }

    impl ReportSource for FakePortal {
        async fn fetch(&self, day: NaiveDate) -> Result<DayReport, PortalError> {
            self.calls.borrow_mut().push(day);
            self.reports
                .get(&day)
                .cloned()
                .ok_or(PortalError::MalformedReport {
                    day,
                    reason: "unexpected day".to_string(),
                })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: RefCell<Vec<Vec<Point>>>,
    }

    impl PointSink for RecordingSink {
        async fn write_points(&self, points: &[Point]) -> Result<(), WriteError> {
            self.batches.borrow_mut().push(points.to_vec());
            Ok(())
        }
    }

    struct FailingSink;

    impl PointSink for FailingSink {
        async fn write_points(&self, _points: &[Point]) -> Result<(), WriteError> {
            Err(WriteError::BeforeEpoch(-1))
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 10).unwrap()
    }

    fn ymd(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    fn data(power: serde_json::Value) -> DayReport {
        let report: RawReport = serde_json::from_value(json!({
            "time": [1_719_806_400_000_i64, 1_719_806_700_000_i64],
            "power": power,
            "energy": [0.1, 0.2],
        }))
        .unwrap();
        DayReport::Data(report)
    }

    #[test]
    fn test_days_to_fetch_range() {
        assert_eq!(days_to_fetch(today(), 2, 4), vec![ymd(8), ymd(7), ymd(6)]);
        assert_eq!(days_to_fetch(today(), 0, 0), vec![today()]);
        assert!(days_to_fetch(today(), 3, 1).is_empty());
    }

    #[test]
    fn test_days_to_fetch_crosses_month() {
        assert_eq!(
            days_to_fetch(today(), 10, 10),
            vec![NaiveDate::from_ymd_opt(2024, 6, 30).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_fetches_each_day_in_order() {
        let days = days_to_fetch(today(), 2, 4);
        let portal = days
            .iter()
            .fold(FakePortal::default(), |p, &d| p.with(d, data(json!([1, 2]))));
        let sink = RecordingSink::default();

        let outcome = run(&portal, &sink, &Tags::new(), &days).await.unwrap();

        assert_eq!(*portal.calls.borrow(), vec![ymd(8), ymd(7), ymd(6)]);
        assert_eq!(sink.batches.borrow().len(), 3);
        assert_eq!(
            outcome,
            RunOutcome::Completed(RunSummary {
                days_written: 3,
                days_skipped: 0,
                points_written: 18,
                readings_skipped: 0,
            })
        );
    }

    #[tokio::test]
    async fn test_range_skips_day_without_data() {
        let days = days_to_fetch(today(), 2, 4);
        let portal = FakePortal::default()
            .with(ymd(8), data(json!([1, 2])))
            .with(ymd(7), DayReport::NoData)
            .with(ymd(6), data(json!([3, 4])));
        let sink = RecordingSink::default();

        let outcome = run(&portal, &sink, &Tags::new(), &days).await.unwrap();

        assert_eq!(portal.calls.borrow().len(), 3);
        assert_eq!(sink.batches.borrow().len(), 2);
        match outcome {
            RunOutcome::Completed(summary) => {
                assert_eq!(summary.days_written, 2);
                assert_eq!(summary.days_skipped, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_day_without_data_stops() {
        let portal = FakePortal::default().with(today(), DayReport::NoData);
        let sink = RecordingSink::default();

        let outcome = run(&portal, &sink, &Tags::new(), &[today()]).await.unwrap();

        assert_eq!(outcome, RunOutcome::NoData(today()));
        assert!(sink.batches.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_range_skips_bad_reading_but_writes_rest() {
        let days = days_to_fetch(today(), 1, 2);
        let portal = FakePortal::default()
            .with(ymd(9), data(json!([1, "broken"])))
            .with(ymd(8), data(json!([3, 4])));
        let sink = RecordingSink::default();

        let outcome = run(&portal, &sink, &Tags::new(), &days).await.unwrap();

        let batches = sink.batches.borrow();
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 6);
        match outcome {
            RunOutcome::Completed(summary) => assert_eq!(summary.readings_skipped, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_day_bad_reading_aborts() {
        let portal = FakePortal::default().with(today(), data(json!([1, "broken"])));
        let sink = RecordingSink::default();

        let result = run(&portal, &sink, &Tags::new(), &[today()]).await;

        assert!(result.is_err());
        assert!(sink.batches.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_aborts_remaining_days() {
        let days = days_to_fetch(today(), 0, 2);
        // Yesterday is unknown to the fake and fails.
        let portal = FakePortal::default()
            .with(today(), data(json!([1, 2])))
            .with(ymd(8), data(json!([1, 2])));
        let sink = RecordingSink::default();

        let err = run(&portal, &sink, &Tags::new(), &days).await.unwrap_err();

        assert!(err.to_string().contains("2024-07-09"), "{err}");
        assert_eq!(portal.calls.borrow().len(), 2);
        assert_eq!(sink.batches.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_write_error_aborts() {
        let days = days_to_fetch(today(), 0, 1);
        let portal = FakePortal::default()
            .with(today(), data(json!([1, 2])))
            .with(ymd(9), data(json!([1, 2])));

        let result = run(&portal, &FailingSink, &Tags::new(), &days).await;

        assert!(result.is_err());
        assert_eq!(portal.calls.borrow().len(), 1);
    }
}
