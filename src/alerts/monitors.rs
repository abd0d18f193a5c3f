//! Background monitor loops spawned by the alert engine
//!
//! Each loop runs on its own cadence and owns no state beyond what it
//! needs between iterations; everything observable goes through
//! [`EngineShared::emit`]. A failed poll skips the iteration rather
//! than inventing observations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::RegexBuilder;
use tokio::time::{interval, sleep};
use tracing::{debug, instrument, warn};

use crate::NodeStatus;
use crate::config::TopicMonitorSpec;
use crate::rosout::{RecordFramer, ROSOUT_ECHO_CMD};
use crate::util::{truncate_message, truthy};

use super::{AlertSeverity, AlertType, EngineShared};

const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);
const TOPIC_PRESENCE_INTERVAL: Duration = Duration::from_secs(10);
const THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);

/// Backoff between rosout subscription attempts.
const PATTERN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Alert messages embed at most this much of the offending log line.
const PATTERN_MESSAGE_LIMIT: usize = 150;

/// Poll the node roster and emit on presence transitions.
///
/// The first sighting of a node is a baseline, not a transition; the
/// emission logic lives in [`EngineShared::update_node_status`], which
/// the reconciler also feeds.
#[instrument(skip(shared))]
pub(crate) async fn liveness_loop(shared: Arc<EngineShared>) {
    let mut ticker = interval(LIVENESS_INTERVAL);

    loop {
        ticker.tick().await;

        let nodes = match shared.ros2.node_list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                debug!("liveness poll failed: {e}, skipping cycle");
                continue;
            }
        };

        let known: Vec<String> = {
            let statuses = shared.node_statuses.lock().unwrap();
            statuses.keys().cloned().collect()
        };

        for name in &nodes {
            shared.update_node_status(name, NodeStatus::Active);
        }
        for name in known {
            if !nodes.contains(&name) {
                shared.update_node_status(&name, NodeStatus::Inactive);
            }
        }
    }
}

/// Check that every configured important topic is being published.
///
/// A topic alerts once per missing episode; recovery closes the episode
/// and emits an informational alert.
#[instrument(skip(shared))]
pub(crate) async fn topic_presence_loop(shared: Arc<EngineShared>) {
    let mut ticker = interval(TOPIC_PRESENCE_INTERVAL);

    loop {
        ticker.tick().await;

        let topics = match shared.ros2.topic_list().await {
            Ok(topics) => topics,
            Err(e) => {
                debug!("topic list poll failed: {e}, skipping cycle");
                continue;
            }
        };

        for topic in &shared.config.important_topics {
            let present = topics.contains(topic);
            let was_missing = shared.missing_topics.lock().unwrap().contains(topic);

            if !present && !was_missing {
                shared.missing_topics.lock().unwrap().insert(topic.clone());
                let mut details = BTreeMap::new();
                details.insert("topic".to_string(), topic.clone());
                shared.emit(
                    AlertType::MissingTopic,
                    AlertSeverity::Warning,
                    "Important topic missing",
                    topic,
                    details,
                    &format!("missing-topic:{topic}"),
                );
            } else if present && was_missing {
                shared.missing_topics.lock().unwrap().remove(topic);
                let mut details = BTreeMap::new();
                details.insert("topic".to_string(), topic.clone());
                shared.emit(
                    AlertType::TopicRecovered,
                    AlertSeverity::Info,
                    "Topic recovered",
                    topic,
                    details,
                    &format!("topic-recovered:{topic}"),
                );
            }
        }
    }
}

/// Watch the rosout stream for configured message patterns.
///
/// Holds its own subscription rather than going through the log
/// collector, so a collector teardown cannot silence alerting. Each
/// record fires at most one alert, for the first pattern that matches.
#[instrument(skip(shared))]
pub(crate) async fn pattern_loop(shared: Arc<EngineShared>) {
    let patterns: Vec<_> = shared
        .config
        .error_patterns
        .iter()
        .filter_map(|spec| {
            match RegexBuilder::new(&spec.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => Some((re, spec.clone())),
                Err(e) => {
                    warn!("skipping invalid error pattern '{}': {e}", spec.pattern);
                    None
                }
            }
        })
        .collect();

    if patterns.is_empty() {
        warn!("no valid error patterns configured, pattern monitor exiting");
        return;
    }

    let conn = shared.ros2.connection();

    loop {
        let mut stream = match conn.exec_stream(ROSOUT_ECHO_CMD).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("pattern monitor subscription failed: {e}, retrying");
                sleep(PATTERN_RETRY_DELAY).await;
                continue;
            }
        };

        let mut framer = RecordFramer::new();
        while let Some(line) = stream.next_line().await {
            let Some(record) = framer.push(&line) else {
                continue;
            };

            for (re, spec) in &patterns {
                if !re.is_match(&record.message) {
                    continue;
                }

                let mut details = BTreeMap::new();
                details.insert("node_name".to_string(), record.node_name.clone());
                details.insert("pattern".to_string(), spec.pattern.clone());
                details.insert("full_message".to_string(), record.message.clone());
                shared.emit(
                    AlertType::ErrorPattern,
                    spec.severity,
                    "Log pattern matched",
                    &format!(
                        "{}: {}",
                        record.node_name,
                        truncate_message(&record.message, PATTERN_MESSAGE_LIMIT)
                    ),
                    details,
                    &format!("error-pattern:{}:{}", spec.pattern, record.node_name),
                );
                break;
            }
        }

        debug!("pattern monitor stream ended, resubscribing");
        sleep(PATTERN_RETRY_DELAY).await;
    }
}

/// Sample one topic and alert when a boolean field crosses into the
/// configured value. Edge-triggered: the alert re-arms only after the
/// field has been observed at the other value again.
#[instrument(skip(shared), fields(topic = %spec.topic))]
pub(crate) async fn threshold_loop(shared: Arc<EngineShared>, spec: TopicMonitorSpec) {
    let field_re = match RegexBuilder::new(&format!(r"{}:\s*(\S+)", regex::escape(&spec.field)))
        .build()
    {
        Ok(re) => re,
        Err(e) => {
            warn!("threshold monitor for {} failed to build: {e}", spec.topic);
            return;
        }
    };

    let mut ticker = interval(THRESHOLD_INTERVAL);
    let mut tripped = false;

    loop {
        ticker.tick().await;

        let output = match shared.ros2.topic_echo_once(&spec.topic).await {
            Ok(output) => output,
            Err(e) => {
                debug!("threshold sample of {} failed: {e}, skipping cycle", spec.topic);
                continue;
            }
        };

        let Some(value) = field_re
            .captures(&output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
        else {
            continue;
        };

        let now_tripped = truthy(value) == spec.alert_on_value;
        if now_tripped && !tripped {
            let mut details = BTreeMap::new();
            details.insert("topic".to_string(), spec.topic.clone());
            details.insert("field".to_string(), spec.field.clone());
            details.insert("value".to_string(), value.to_string());
            shared.emit(
                AlertType::TopicValue,
                AlertSeverity::Critical,
                "Monitored topic value tripped",
                &format!("{}.{} = {}", spec.topic, spec.field, value),
                details,
                &format!("topic-value:{}:{}", spec.topic, spec.field),
            );
        }
        tripped = now_tripped;
    }
}
