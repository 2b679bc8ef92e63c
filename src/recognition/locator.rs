use async_trait::async_trait;

use crate::config::{MissingTablePolicy, RecognitionConfig};
use crate::errors::{TowerError, TowerResult};
use crate::recognition::priority::PriorityTable;
use crate::recognition::probe::{Probe, PROBE_ENTRY};
use crate::recognition::traits::{CustomRecognition, RecognitionHost};
use crate::recognition::types::{AnalyzeArgs, AnalyzeResult, Frame, Rect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    Priority { priority: i64, label: String },
    Fallback { template: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorResult {
    pub rect: Rect,
    pub kind: MatchKind,
    /// Host calls issued to reach this result, fallback included.
    pub probes: usize,
}

impl LocatorResult {
    pub fn detail(&self) -> String {
        match &self.kind {
            MatchKind::Priority { priority, label } => {
                format!("Found {label} with priority {priority}")
            }
            MatchKind::Fallback { template } => format!("Fallback used: {template}"),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.kind, MatchKind::Fallback { .. })
    }
}

/// Finds the highest-priority label visible in a frame.
///
/// Labels are probed one OCR call at a time, highest priority first and in
/// list order within a level; the first hit ends the scan. When nothing hits,
/// a single template-match probe against the fallback asset decides.
#[derive(Debug, Clone)]
pub struct PriorityTargetLocator {
    param_key: String,
    fallback_template: String,
    missing_table: MissingTablePolicy,
    placeholder_label: String,
}

impl PriorityTargetLocator {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            param_key: config.param_key.clone(),
            fallback_template: config.fallback_template.clone(),
            missing_table: config.missing_table,
            placeholder_label: config.placeholder_label.clone(),
        }
    }

    /// Turn the custom parameter block into the table to search.
    pub fn resolve_table(&self, custom_param: &serde_json::Value) -> TowerResult<PriorityTable> {
        if let Some(table) = PriorityTable::from_custom_param(custom_param, &self.param_key)? {
            return Ok(table);
        }
        match self.missing_table {
            MissingTablePolicy::Reject => Err(TowerError::Config(format!(
                "custom parameter '{}' with the priority table is missing",
                self.param_key
            ))),
            MissingTablePolicy::Placeholder => {
                tracing::warn!(
                    key = %self.param_key,
                    label = %self.placeholder_label,
                    "priority table missing, searching placeholder label"
                );
                Ok(PriorityTable::placeholder(&self.placeholder_label))
            }
        }
    }

    pub async fn locate(
        &self,
        host: &dyn RecognitionHost,
        frame: &Frame,
        table: &PriorityTable,
    ) -> TowerResult<LocatorResult> {
        let mut probes = 0;

        for level in table.levels() {
            for label in &level.labels {
                tracing::debug!(priority = level.priority, label = %label, "probing label");
                if let Some(rect) = self.probe(host, frame, Probe::Text(label), &mut probes).await? {
                    tracing::info!(
                        priority = level.priority,
                        label = %label,
                        rect = %rect,
                        probes,
                        "target found"
                    );
                    return Ok(LocatorResult {
                        rect,
                        kind: MatchKind::Priority {
                            priority: level.priority,
                            label: label.clone(),
                        },
                        probes,
                    });
                }
            }
        }

        tracing::info!(
            labels = table.label_count(),
            template = %self.fallback_template,
            "no label found, probing fallback template"
        );
        let fallback = Probe::Template(&self.fallback_template);
        match self.probe(host, frame, fallback, &mut probes).await? {
            Some(rect) => {
                tracing::info!(rect = %rect, probes, "fallback template found");
                Ok(LocatorResult {
                    rect,
                    kind: MatchKind::Fallback {
                        template: self.fallback_template.clone(),
                    },
                    probes,
                })
            }
            None => {
                tracing::info!(probes, "fallback template not found");
                Err(TowerError::NoTargetFound { probes })
            }
        }
    }

    async fn probe(
        &self,
        host: &dyn RecognitionHost,
        frame: &Frame,
        probe: Probe<'_>,
        probes: &mut usize,
    ) -> TowerResult<Option<Rect>> {
        *probes += 1;
        let detail = host
            .run_recognition(PROBE_ENTRY, frame, probe.pipeline_override())
            .await?;

        let Some(detail) = detail else {
            tracing::debug!(query = %probe.target(), "no recognition detail");
            return Ok(None);
        };
        let Some(rect) = detail.hit_box()? else {
            tracing::debug!(query = %probe.target(), reco_id = detail.reco_id, "miss");
            return Ok(None);
        };

        if rect.is_empty() {
            tracing::warn!(query = %probe.target(), rect = %rect, "hit with empty box, counted as miss");
            return Ok(None);
        }
        if !rect.fits_within(frame.width(), frame.height()) {
            tracing::warn!(
                query = %probe.target(),
                rect = %rect,
                frame_width = frame.width(),
                frame_height = frame.height(),
                "hit box exceeds the frame, passing it through"
            );
        }
        Ok(Some(rect))
    }
}

#[async_trait]
impl CustomRecognition for PriorityTargetLocator {
    async fn analyze(
        &self,
        host: &dyn RecognitionHost,
        args: AnalyzeArgs<'_>,
    ) -> TowerResult<AnalyzeResult> {
        let table = self.resolve_table(args.custom_param)?;
        tracing::debug!(
            task = %args.task,
            levels = table.levels().len(),
            labels = table.label_count(),
            "priority table resolved"
        );

        match self.locate(host, args.frame, &table).await {
            Ok(found) => Ok(AnalyzeResult {
                rect: Some(found.rect),
                detail: found.detail(),
            }),
            Err(e @ TowerError::NoTargetFound { .. }) => Ok(AnalyzeResult {
                rect: None,
                detail: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use super::*;
    use crate::recognition::types::{test_frame, RecognitionDetail};

    /// Host stub that answers from a script and records every probe.
    #[derive(Default)]
    struct ScriptedHost {
        hits: HashMap<String, Rect>,
        faults: Vec<String>,
        /// Targets on which the host connection itself fails.
        disconnects: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedHost {
        fn hitting(targets: &[&str]) -> Self {
            let hits = targets
                .iter()
                .enumerate()
                .map(|(i, t)| (t.to_string(), Rect::new(10 * i as i32, 5, 20, 10)))
                .collect();
            Self {
                hits,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecognitionHost for ScriptedHost {
        async fn run_recognition(
            &self,
            entry: &str,
            _frame: &Frame,
            pipeline_override: Value,
        ) -> TowerResult<Option<RecognitionDetail>> {
            let node = &pipeline_override[entry];
            assert_eq!(node["action"], "DoNothing");
            let target = match node["recognition"].as_str() {
                Some("OCR") => node["expected"].as_str().unwrap().to_string(),
                Some("TemplateMatch") => node["template"][0].as_str().unwrap().to_string(),
                other => panic!("unexpected recognition {other:?}"),
            };
            self.calls.lock().unwrap().push(target.clone());

            if self.faults.contains(&target) {
                return Err(TowerError::Probe(format!("host fault on {target}")));
            }
            if self.disconnects.contains(&target) {
                return Err(TowerError::Agent("host went away".into()));
            }
            Ok(Some(match self.hits.get(&target) {
                Some(rect) => RecognitionDetail::hit(*rect),
                None => RecognitionDetail::miss(),
            }))
        }
    }

    fn locator() -> PriorityTargetLocator {
        PriorityTargetLocator::from_config(&RecognitionConfig::default())
    }

    fn table(text: &str) -> PriorityTable {
        PriorityTable::parse(text).unwrap()
    }

    #[tokio::test]
    async fn lower_priority_hit_after_full_prefix() {
        let host = ScriptedHost::hitting(&["C"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"3": ["A", "B"], "2": ["C"]}"#))
            .await
            .unwrap();

        assert_eq!(
            found.kind,
            MatchKind::Priority {
                priority: 2,
                label: "C".into()
            }
        );
        assert_eq!(found.probes, 3);
        assert_eq!(host.calls(), vec!["A", "B", "C"]);
        assert_eq!(found.detail(), "Found C with priority 2");
    }

    #[tokio::test]
    async fn first_hit_short_circuits() {
        let host = ScriptedHost::hitting(&["A", "B", "C"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"3": ["A", "B"], "2": ["C"]}"#))
            .await
            .unwrap();

        assert_eq!(found.probes, 1);
        assert_eq!(host.calls(), vec!["A"]);
    }

    #[tokio::test]
    async fn first_listed_label_wins_within_level() {
        let host = ScriptedHost::hitting(&["B", "A"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"1": ["A", "B"]}"#))
            .await
            .unwrap();

        assert_eq!(
            found.kind,
            MatchKind::Priority {
                priority: 1,
                label: "A".into()
            }
        );
        assert_eq!(found.rect, host.hits["A"]);
    }

    #[tokio::test]
    async fn higher_priority_beats_list_position() {
        let host = ScriptedHost::hitting(&["low", "high"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"9": ["low"], "10": ["miss", "high"]}"#))
            .await
            .unwrap();

        assert_eq!(
            found.kind,
            MatchKind::Priority {
                priority: 10,
                label: "high".into()
            }
        );
        assert_eq!(host.calls(), vec!["miss", "high"]);
    }

    #[tokio::test]
    async fn empty_table_probes_fallback_once() {
        let host = ScriptedHost::hitting(&["recommend_card.png"]);
        let frame = test_frame(200, 100);
        let found = locator().locate(&host, &frame, &table("{}")).await.unwrap();

        assert!(found.is_fallback());
        assert_eq!(found.probes, 1);
        assert_eq!(host.calls(), vec!["recommend_card.png"]);
    }

    #[tokio::test]
    async fn fallback_after_all_labels_miss() {
        let host = ScriptedHost::hitting(&["recommend_card.png"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"2": ["A"], "1": ["B", "C"]}"#))
            .await
            .unwrap();

        assert!(found.is_fallback());
        assert_eq!(found.probes, 4);
        assert_eq!(host.calls(), vec!["A", "B", "C", "recommend_card.png"]);
    }

    #[tokio::test]
    async fn fallback_miss_is_no_target_found() {
        let host = ScriptedHost::default();
        let frame = test_frame(200, 100);
        let err = locator()
            .locate(&host, &frame, &table(r#"{"1": ["X"]}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, TowerError::NoTargetFound { probes: 2 }));
        assert_eq!(host.calls(), vec!["X", "recommend_card.png"]);
    }

    #[tokio::test]
    async fn host_fault_stops_scan() {
        let host = ScriptedHost {
            faults: vec!["B".into()],
            ..ScriptedHost::hitting(&["C"])
        };
        let frame = test_frame(200, 100);
        let err = locator()
            .locate(&host, &frame, &table(r#"{"3": ["A", "B"], "2": ["C"]}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, TowerError::Probe(_)));
        assert_eq!(host.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn host_agent_error_passes_through_unchanged() {
        let host = ScriptedHost {
            disconnects: vec!["A".into()],
            ..ScriptedHost::hitting(&["B"])
        };
        let frame = test_frame(200, 100);
        let err = locator()
            .locate(&host, &frame, &table(r#"{"1": ["A", "B"]}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, TowerError::Agent(ref m) if m == "host went away"));
        assert_eq!(host.calls(), vec!["A"]);
    }

    #[tokio::test]
    async fn box_outside_frame_is_kept() {
        // hitting() places "B" at (10, 5, 20, 10), past the right edge of 15x15.
        let host = ScriptedHost::hitting(&["A", "B"]);
        let frame = test_frame(15, 15);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"2": ["B"], "1": ["A"]}"#))
            .await
            .unwrap();

        assert_eq!(found.rect, Rect::new(10, 5, 20, 10));
        assert_eq!(found.detail(), "Found B with priority 2");
        assert_eq!(found.probes, 1);
    }

    #[tokio::test]
    async fn empty_box_counts_as_miss() {
        let mut host = ScriptedHost::hitting(&["B"]);
        host.hits.insert("A".into(), Rect::new(4, 4, 0, 10));
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"1": ["A", "B"]}"#))
            .await
            .unwrap();

        assert_eq!(
            found.kind,
            MatchKind::Priority {
                priority: 1,
                label: "B".into()
            }
        );
        assert_eq!(host.calls(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn empty_label_is_searched_in_order() {
        let host = ScriptedHost::hitting(&["X"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"1": ["", "X"]}"#))
            .await
            .unwrap();

        assert_eq!(host.calls(), vec!["", "X"]);
        assert_eq!(found.detail(), "Found X with priority 1");
    }

    #[tokio::test]
    async fn merged_levels_scan_in_document_order() {
        let host = ScriptedHost::hitting(&["B"]);
        let frame = test_frame(200, 100);
        let found = locator()
            .locate(&host, &frame, &table(r#"{"3": ["A"], "1": ["Z"], "03": ["B"]}"#))
            .await
            .unwrap();

        assert_eq!(host.calls(), vec!["A", "B"]);
        assert_eq!(found.detail(), "Found B with priority 3");
    }

    #[tokio::test]
    async fn analyze_reports_no_result_instead_of_failing() {
        let host = ScriptedHost::default();
        let frame = test_frame(200, 100);
        let param = json!({"work": r#"{"1": ["X"]}"#});
        let result = locator()
            .analyze(
                &host,
                AnalyzeArgs {
                    task: "PickTower",
                    name: "auto_tower",
                    custom_param: &param,
                    frame: &frame,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.rect, None);
        assert!(result.detail.contains("No target found"));
    }

    #[tokio::test]
    async fn missing_table_is_rejected_by_default() {
        let host = ScriptedHost::hitting(&["recommend_card.png"]);
        let frame = test_frame(200, 100);
        let param = json!({});
        let err = locator()
            .analyze(
                &host,
                AnalyzeArgs {
                    task: "PickTower",
                    name: "auto_tower",
                    custom_param: &param,
                    frame: &frame,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TowerError::Config(_)));
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_table_searches_placeholder_when_configured() {
        let config = RecognitionConfig {
            missing_table: MissingTablePolicy::Placeholder,
            ..RecognitionConfig::default()
        };
        let host = ScriptedHost::hitting(&["default_value"]);
        let frame = test_frame(200, 100);
        let result = PriorityTargetLocator::from_config(&config)
            .analyze(
                &host,
                AnalyzeArgs {
                    task: "PickTower",
                    name: "auto_tower",
                    custom_param: &Value::Null,
                    frame: &frame,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.detail, "Found default_value with priority 0");
        assert_eq!(host.calls(), vec!["default_value"]);
    }
}
