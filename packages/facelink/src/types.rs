// Data model shared between the transports, the result store and the renderer
//
// Field names follow the backend's camelCase JSON so tasks pushed by the server
// deserialize directly. Sequences (faces, search results) are kept in the order
// the backend produced them and are never re-sorted on the client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tokio::time::{Duration, Instant};

/// Face embedding. Length is decided by the backend.
pub type RecognitionVector = Vec<f32>;

/// Opaque image payload produced by a capture source
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub data: Bytes,
    pub content_type: String,
}

impl Image {
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: content_type.into(),
        }
    }

    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self::new(data, "image/jpeg")
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Face bounds in source-frame pixel coordinates
///
/// `(0, 0, 0, 0)` is the "no detection" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl DetectionBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// True for the "no detection" sentinel
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }
}

impl fmt::Display for DetectionBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {}) ({} {})", self.x1, self.y1, self.x2, self.y2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub distance: f64,
    pub label: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Face {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub position: DetectionBox,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<RecognitionVector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_results: Option<Vec<SearchResult>>,
}

impl Face {
    pub fn has_search_results(&self) -> bool {
        self.search_results
            .as_ref()
            .map(|results| !results.is_empty())
            .unwrap_or(false)
    }

    /// Best match as ranked by the backend (first entry)
    pub fn top_match(&self) -> Option<&SearchResult> {
        self.search_results.as_ref().and_then(|results| results.first())
    }
}

/// Backend timestamps arrive either as epoch numbers or as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskTime {
    Number(f64),
    Text(String),
}

impl fmt::Display for TaskTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskTime::Number(n) => write!(f, "{}", n),
            TaskTime::Text(s) => write!(f, "{}", s),
        }
    }
}

/// States other than `Pending`/`Completed` decode as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubTaskState {
    Pending,
    Completed,
    #[serde(other)]
    Unknown,
}

/// Status marker for one backend subtask (detection, vector, search)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    #[serde(rename = "_time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TaskTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub state: SubTaskState,
}

impl SubTask {
    pub fn completed(time: Option<TaskTime>) -> Self {
        Self {
            time,
            id: None,
            state: SubTaskState::Completed,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == SubTaskState::Completed
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// One unit of work produced by the backend
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "_time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TaskTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub faces: Vec<Face>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_detection: Option<SubTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_vector: Option<SubTask>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_search: Option<SubTask>,
}

impl Task {
    /// Build a detection-only task from a locally obtained box.
    ///
    /// The sentinel box yields a task with no faces.
    pub fn from_detection(region: DetectionBox) -> Self {
        let now = Utc::now();
        let time = Some(TaskTime::Number(now.timestamp_millis() as f64));
        let faces = if region.is_empty() {
            Vec::new()
        } else {
            vec![Face {
                id: uuid::Uuid::new_v4().to_string(),
                position: region,
                vector: None,
                search_results: None,
            }]
        };

        Self {
            time: time.clone(),
            count: Some(faces.len() as u32),
            faces,
            timestamp: Some(now.to_rfc3339()),
            task_detection: Some(SubTask::completed(time)),
            task_vector: None,
            task_search: None,
        }
    }

    /// Build an enriched task for one recognized face.
    pub fn from_recognition(
        region: DetectionBox,
        vector: RecognitionVector,
        search_results: Option<Vec<SearchResult>>,
    ) -> Self {
        let now = Utc::now();
        let time = Some(TaskTime::Number(now.timestamp_millis() as f64));
        let searched = search_results.is_some();

        Self {
            time: time.clone(),
            count: Some(1),
            faces: vec![Face {
                id: uuid::Uuid::new_v4().to_string(),
                position: region,
                vector: Some(vector),
                search_results,
            }],
            timestamp: Some(now.to_rfc3339()),
            task_detection: Some(SubTask::completed(time.clone())),
            task_vector: Some(SubTask::completed(time.clone())),
            task_search: searched.then(|| SubTask::completed(time)),
        }
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Stage a pushed task belongs to: enriched once search has completed or
    /// any face already carries search results.
    pub fn stage(&self) -> Stage {
        let searched = self
            .task_search
            .as_ref()
            .map(SubTask::is_completed)
            .unwrap_or(false);

        if searched || self.faces.iter().any(Face::has_search_results) {
            Stage::Stage2
        } else {
            Stage::Stage1
        }
    }
}

/// Pipeline phase a result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Detection-only result
    Stage1,
    /// Result enriched with recognition/search
    Stage2,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Stage1, Stage::Stage2];

    pub(crate) fn index(self) -> usize {
        match self {
            Stage::Stage1 => 0,
            Stage::Stage2 => 1,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Stage1 => write!(f, "Stage1"),
            Stage::Stage2 => write!(f, "Stage2"),
        }
    }
}

/// Result store entry: a task plus when it was received locally
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub task: Task,
    pub stage: Stage,
    pub received_at: Instant,
    pub received_wall: DateTime<Utc>,
}

impl PipelineResult {
    pub fn new(stage: Stage, task: Task) -> Self {
        Self {
            task,
            stage,
            received_at: Instant::now(),
            received_wall: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_box() {
        assert!(DetectionBox::default().is_empty());
        assert!(!DetectionBox::new(10.0, 20.0, 30.0, 40.0).is_empty());
        let region = DetectionBox::new(10.0, 20.0, 30.0, 60.0);
        assert_eq!(region.width(), 20.0);
        assert_eq!(region.height(), 40.0);
    }

    #[test]
    fn test_task_deserializes_backend_shape() {
        let json = r#"{
            "_time": 1700000000123,
            "count": 2,
            "timestamp": "2024-01-01T00:00:00Z",
            "faces": [
                {"id": "a", "position": {"x1": 1, "y1": 2, "x2": 3, "y2": 4},
                 "vector": [0.5, 0.25],
                 "searchResults": [{"distance": 0.9, "label": 7}, {"distance": 0.95, "label": 3}]},
                {"id": "b", "position": {"x1": 5, "y1": 6, "x2": 7, "y2": 8}}
            ],
            "taskDetection": {"_time": "12ms", "state": "Completed"},
            "taskSearch": {"_time": 40, "state": "Pending"}
        }"#;

        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.face_count(), 2);
        assert_eq!(task.faces[0].position, DetectionBox::new(1.0, 2.0, 3.0, 4.0));

        // Backend order is preserved even when it is not sorted by distance
        let results = task.faces[0].search_results.as_ref().unwrap();
        assert_eq!(results[0].label, 7);
        assert_eq!(results[1].label, 3);
        assert!(task.faces[1].search_results.is_none());
        assert_eq!(
            task.task_detection.as_ref().unwrap().time,
            Some(TaskTime::Text("12ms".to_string()))
        );
    }

    #[test]
    fn test_stage_classification() {
        let mut task = Task::from_detection(DetectionBox::new(1.0, 1.0, 5.0, 5.0));
        assert_eq!(task.stage(), Stage::Stage1);

        task.task_search = Some(SubTask {
            time: None,
            id: None,
            state: SubTaskState::Pending,
        });
        assert_eq!(task.stage(), Stage::Stage1);

        task.faces[0].search_results = Some(vec![SearchResult {
            distance: 0.4,
            label: 1,
        }]);
        assert_eq!(task.stage(), Stage::Stage2);

        let recognized = Task::from_recognition(DetectionBox::new(1.0, 1.0, 5.0, 5.0), vec![0.0], None);
        assert_eq!(recognized.stage(), Stage::Stage1);
        assert!(recognized.task_search.is_none());
    }

    #[test]
    fn test_detection_task_for_sentinel_has_no_faces() {
        let task = Task::from_detection(DetectionBox::default());
        assert!(task.faces.is_empty());
        assert_eq!(task.count, Some(0));
        assert!(task.task_detection.unwrap().is_completed());
    }
}
