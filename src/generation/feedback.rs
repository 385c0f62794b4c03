use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use super::StructuredOutput;
use crate::storage::StyleProfile;

/// Deserialize a field, falling back to its default when the value has the
/// wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// A titled observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedbackPoint {
    #[serde(default, deserialize_with = "lenient")]
    pub point: String,
    #[serde(default, deserialize_with = "lenient")]
    pub detail: String,
}

impl FeedbackPoint {
    fn new(point: &str, detail: &str) -> Self {
        Self {
            point: point.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// A small actionable change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuickFix {
    #[serde(default, deserialize_with = "lenient")]
    pub suggestion: String,
    #[serde(default, deserialize_with = "lenient")]
    pub impact: String,
}

/// How well the outfit fits the stated occasion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OccasionMatch {
    pub score: f64,
    #[serde(default, deserialize_with = "lenient")]
    pub notes: String,
}

/// Structured attributes extracted from the photo.
///
/// Every field is optional and tolerates a mistyped value, which reads as
/// absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleDna {
    #[serde(default, deserialize_with = "lenient")]
    pub dominant_colors: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub color_harmony: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub color_count: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub formality_level: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub style_archetypes: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub silhouette_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub garments: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub patterns: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub textures: Vec<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub color_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub proportion_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub fit_score: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub coherence_score: Option<f64>,
}

/// The structured outfit feedback returned to users.
///
/// Only `overallScore`, `summary` and `whatsWorking` must be well formed;
/// the rest are backfilled or dropped when the model gets their shape wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResult {
    pub overall_score: f64,
    pub summary: String,
    #[serde(deserialize_with = "lenient_points")]
    pub whats_working: Vec<FeedbackPoint>,
    #[serde(default, deserialize_with = "lenient_points")]
    pub consider: Vec<FeedbackPoint>,
    #[serde(default, deserialize_with = "lenient")]
    pub quick_fixes: Vec<QuickFix>,
    #[serde(default, deserialize_with = "lenient")]
    pub occasion_match: Option<OccasionMatch>,
    #[serde(default, rename = "styleDNA", deserialize_with = "lenient")]
    pub style_dna: Option<StyleDna>,
}

/// Keep the well-formed entries of a point list.
fn lenient_points<'de, D>(deserializer: D) -> Result<Vec<FeedbackPoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter(|item| item.is_object())
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default())
}

impl FeedbackResult {
    /// Output schema sent with feedback requests.
    pub fn response_schema() -> Value {
        let point_list = |a: &str, b: &str| {
            json!({
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        a: { "type": "STRING" },
                        b: { "type": "STRING" }
                    }
                }
            })
        };
        let strings = json!({ "type": "ARRAY", "items": { "type": "STRING" } });
        let nullable = |t: &str| json!({ "type": t, "nullable": true });

        json!({
            "type": "OBJECT",
            "properties": {
                "overallScore": { "type": "NUMBER" },
                "summary": { "type": "STRING" },
                "whatsWorking": point_list("point", "detail"),
                "consider": point_list("point", "detail"),
                "quickFixes": point_list("suggestion", "impact"),
                "occasionMatch": {
                    "type": "OBJECT",
                    "properties": {
                        "score": { "type": "NUMBER" },
                        "notes": { "type": "STRING" }
                    }
                },
                "styleDNA": {
                    "type": "OBJECT",
                    "properties": {
                        "dominantColors": strings,
                        "colorHarmony": nullable("STRING"),
                        "colorCount": nullable("NUMBER"),
                        "formalityLevel": nullable("NUMBER"),
                        "styleArchetypes": strings,
                        "silhouetteType": nullable("STRING"),
                        "garments": strings,
                        "patterns": strings,
                        "textures": strings,
                        "colorScore": nullable("NUMBER"),
                        "proportionScore": nullable("NUMBER"),
                        "fitScore": nullable("NUMBER"),
                        "coherenceScore": nullable("NUMBER")
                    },
                    "required": ["dominantColors", "styleArchetypes", "garments", "patterns", "textures"]
                }
            },
            "required": [
                "overallScore", "summary", "whatsWorking", "consider",
                "quickFixes", "occasionMatch", "styleDNA"
            ]
        })
    }

    /// Attributes for the knowledge miner, normalized to lowercase.
    pub fn style_profile(&self) -> Option<StyleProfile> {
        let dna = self.style_dna.as_ref()?;
        let lower = |v: &[String]| {
            v.iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };

        Some(StyleProfile {
            dominant_colors: lower(&dna.dominant_colors),
            style_archetypes: lower(&dna.style_archetypes),
            formality_level: dna.formality_level.map(|f| f.round() as i64),
            silhouette_type: dna
                .silhouette_type
                .as_ref()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        })
    }
}

fn neutral_style_dna(sub_score: f64) -> StyleDna {
    StyleDna {
        color_harmony: Some("neutral".to_string()),
        color_count: Some(0.0),
        formality_level: Some(3.0),
        silhouette_type: Some("balanced".to_string()),
        color_score: Some(sub_score),
        proportion_score: Some(sub_score),
        fit_score: Some(sub_score),
        coherence_score: Some(sub_score),
        ..StyleDna::default()
    }
}

fn non_empty_array(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key)
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty())
}

impl StructuredOutput for FeedbackResult {
    const NAME: &'static str = "feedback";

    fn missing_required(value: &Value) -> Vec<&'static str> {
        let Some(obj) = value.as_object() else {
            return vec!["overallScore", "summary", "whatsWorking"];
        };

        let mut missing = Vec::new();
        if !obj.get("overallScore").is_some_and(Value::is_number) {
            missing.push("overallScore");
        }
        if !obj
            .get("summary")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
        {
            missing.push("summary");
        }
        if !obj.get("whatsWorking").is_some_and(Value::is_array) {
            missing.push("whatsWorking");
        }
        missing
    }

    fn backfill(mut value: Value) -> Value {
        let Some(obj) = value.as_object_mut() else {
            return value;
        };

        if !obj.get("overallScore").is_some_and(Value::is_number) {
            obj.insert("overallScore".into(), json!(6));
        }
        if !obj
            .get("summary")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
        {
            obj.insert("summary".into(), json!("Your outfit has been analyzed."));
        }
        if !non_empty_array(obj, "whatsWorking") {
            obj.insert(
                "whatsWorking".into(),
                json!([FeedbackPoint::new("Overall look", "Your outfit has a cohesive feel.")]),
            );
        }
        if !non_empty_array(obj, "consider") {
            obj.insert(
                "consider".into(),
                json!([FeedbackPoint::new(
                    "Resubmit for full feedback",
                    "Analysis was only partially completed. Try again for complete detail."
                )]),
            );
        }
        if !obj.get("quickFixes").is_some_and(Value::is_array) {
            obj.insert("quickFixes".into(), json!([]));
        }
        let occasion_ok = obj
            .get("occasionMatch")
            .and_then(|o| o.get("score"))
            .is_some_and(Value::is_number);
        if !occasion_ok {
            obj.insert(
                "occasionMatch".into(),
                json!(OccasionMatch {
                    score: 6.0,
                    notes: "Appropriate for the occasion.".to_string(),
                }),
            );
        }
        let dna_ok = obj
            .get("styleDNA")
            .and_then(|d| d.get("dominantColors"))
            .is_some_and(Value::is_array);
        if !dna_ok {
            obj.insert("styleDNA".into(), json!(neutral_style_dna(6.0)));
        }

        value
    }

    fn fallback() -> Self {
        Self {
            overall_score: 7.0,
            summary: "Looking good! We're having trouble analyzing the details right now, \
                      but your outfit has great potential."
                .to_string(),
            whats_working: vec![FeedbackPoint::new(
                "Overall presentation",
                "You look put together and ready for the occasion.",
            )],
            consider: vec![FeedbackPoint::new(
                "Try again for detailed feedback",
                "We're experiencing technical difficulties. Your next check will have full analysis!",
            )],
            quick_fixes: Vec::new(),
            occasion_match: Some(OccasionMatch {
                score: 7.0,
                notes: "Appropriate for the occasion".to_string(),
            }),
            style_dna: Some(neutral_style_dna(7.0)),
        }
    }
}

/// Gaps found by classifying follow-up questions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GapReport {
    #[serde(default)]
    pub gaps: Vec<String>,
}

impl StructuredOutput for GapReport {
    const NAME: &'static str = "follow-up-gaps";

    fn missing_required(value: &Value) -> Vec<&'static str> {
        if value.get("gaps").is_some_and(Value::is_array) {
            Vec::new()
        } else {
            vec!["gaps"]
        }
    }

    fn backfill(mut value: Value) -> Value {
        if let Some(obj) = value.as_object_mut() {
            // Keep only string entries
            let gaps: Vec<Value> = obj
                .get("gaps")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter(|g| g.is_string()).cloned().collect())
                .unwrap_or_default();
            obj.insert("gaps".into(), Value::Array(gaps));
        }
        value
    }

    fn fallback() -> Self {
        Self::default()
    }
}
