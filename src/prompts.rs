//! Centralized prompt definitions
//!
//! This module holds the baseline variant (the instruction text served when
//! nothing else is registered or storage is unreachable) and the builders
//! for the prompts the improvement loop sends on its own behalf.

use crate::storage::DiscoveredRule;

/// Version label of the hardcoded baseline variant.
pub const BASELINE_VERSION: &str = "v2.0";

/// Baseline instruction text for outfit feedback.
///
/// Must keep the `PERSONALITY:` and `RESPONSE FORMAT:` sections and mention
/// `overallScore` and `styleDNA`; candidate variants are validated against
/// those markers.
pub const BASELINE_VARIANT: &str = r#"You are a professional personal stylist with a working knowledge of color theory, proportion and dress codes. Help people look and feel their best through specific, actionable advice.

PERSONALITY:
- Warm and encouraging, like a supportive friend who happens to know fashion
- Honest but tactful: always find what works before suggesting changes
- Specific: name the garment, the color, the principle
- Never judgmental about bodies or personal taste

FASHION KNOWLEDGE BASE:
COLOR: Complementary pairs (navy/burnt orange) give contrast, analogous palettes give harmony, monochrome elongates. Neutrals (black, white, gray, beige, navy, metallics) pair with everything. More than three colors risks looking busy.
PROPORTION: Balance volume (oversized top, fitted bottom or the reverse). High rises lengthen the leg. Vertical lines elongate, horizontal lines widen.
FIT: Shoulder seams sit at the shoulder point, sleeves end at the wrist bone, trousers break cleanly. Tailoring makes inexpensive clothes look expensive.
DRESS CODES: casual, smart casual, business casual, business formal, cocktail, black tie. Match formality across every piece of the outfit.

ANALYSIS APPROACH:
1. Assess color harmony
2. Evaluate proportion and silhouette
3. Check fit
4. Judge the outfit against the occasion and dress code
5. Start with what works, then give one or two concrete improvements

RESPONSE FORMAT:
Return ONLY valid JSON with this structure:
{
  "overallScore": <number 1-10>,
  "summary": "<one encouraging sentence about the overall look>",
  "whatsWorking": [{"point": "<2-5 words>", "detail": "<1-2 sentences>"}],
  "consider": [{"point": "<2-5 words>", "detail": "<1-2 sentences>"}],
  "quickFixes": [{"suggestion": "<actionable tip>", "impact": "<benefit in under 12 words>"}],
  "occasionMatch": {"score": <number 1-10>, "notes": "<dress code fit only>"},
  "styleDNA": {
    "dominantColors": ["<specific color>"],
    "colorHarmony": "<complementary|analogous|monochromatic|triadic|neutral>",
    "colorCount": <number>,
    "formalityLevel": <1-5>,
    "styleArchetypes": ["<minimalist|classic|preppy|streetwear|bohemian|romantic|edgy|sporty|vintage|...>"],
    "silhouetteType": "<fitted|relaxed|layered|structured|oversized|balanced>",
    "garments": ["<each visible item>"],
    "patterns": ["<solid|striped|plaid|floral|...>"],
    "textures": ["<denim|cotton|silk|leather|knit|...>"],
    "colorScore": <1-10>,
    "proportionScore": <1-10>,
    "fitScore": <1-10>,
    "coherenceScore": <1-10>
  }
}

SCORING GUIDE:
Use the full 1-10 range. A typical casual outfit is 5-6, a considered look 7-8, only exceptional outfits earn 9-10. Give 2-3 items in whatsWorking and in consider, and keep every field distinct from the others."#;

/// Context the user supplied alongside the photo.
#[derive(Debug, Clone, Default)]
pub struct FeedbackContext {
    pub occasions: Vec<String>,
    pub setting: Option<String>,
    pub weather: Option<String>,
    pub vibe: Option<String>,
    pub concerns: Option<String>,
}

/// Build the user prompt that accompanies the photo.
pub fn build_feedback_prompt(ctx: &FeedbackContext) -> String {
    let mut lines = vec![
        "Analyze this outfit photo.".to_string(),
        String::new(),
        "Context:".to_string(),
    ];

    if ctx.occasions.is_empty() {
        lines.push("- Occasion(s): everyday".to_string());
    } else {
        lines.push(format!("- Occasion(s): {}", ctx.occasions.join(", ")));
    }
    if let Some(setting) = &ctx.setting {
        lines.push(format!("- Setting: {}", setting));
    }
    if let Some(weather) = &ctx.weather {
        lines.push(format!("- Weather: {}", weather));
    }
    if let Some(vibe) = &ctx.vibe {
        lines.push(format!("- Desired vibe: {}", vibe));
    }
    if let Some(concerns) = &ctx.concerns {
        lines.push(format!("- User's concerns: {}", concerns));
    }

    lines.push(String::new());
    lines.push("Respond with the JSON object only.".to_string());
    lines.join("\n")
}

/// Build the follow-up gap classification prompt.
pub fn build_follow_up_prompt(questions: &[String]) -> String {
    let numbered = questions
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. \"{}\"", i + 1, q))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"These are follow-up questions users asked AFTER receiving outfit feedback.
Each one hints at something the original feedback did not address.

Questions ({count} samples from the last two weeks):
{numbered}

Identify the 3-5 most frequent topics or gaps. Phrase each gap as a weakness
of the feedback, e.g. "Feedback doesn't address occasion-specific formality rules".

Return JSON only:
{{"gaps": ["<gap>", "<gap>"]}}"#,
        count = questions.len(),
        numbered = numbered
    )
}

/// Characters of the base variant quoted in the cohort prompt.
pub const COHORT_BASE_EXCERPT_CHARS: usize = 800;

/// What the cohort addition prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct CohortPromptInput<'a> {
    pub label: &'a str,
    pub occasions: &'a [String],
    pub avg_rating: f64,
    pub sample_size: usize,
    pub base_text: &'a str,
}

/// Build the instruction for a cohort-specific addition to the base variant.
pub fn build_cohort_prompt(input: &CohortPromptInput<'_>) -> String {
    let occasions = if input.occasions.is_empty() {
        "various".to_string()
    } else {
        input.occasions.join(", ")
    };
    let excerpt: String = input
        .base_text
        .chars()
        .take(COHORT_BASE_EXCERPT_CHARS)
        .collect();

    format!(
        r#"You are specializing a styling feedback prompt for one group of users.

USER COHORT: {label} style
COMMON OCCASIONS: {occasions}
AVERAGE USER RATING: {avg_rating:.1}/5 (n={sample_size})

Write a short ADDITION of 2-3 paragraphs, at most 400 words, to prepend to the
system prompt below. It should give the stylist specific knowledge about the
{label} aesthetic: the silhouettes, colors and rules that matter most to these
users, and what they value in feedback.

Return ONLY the addition text. No preamble, no headings, no code fences.

=== BASE SYSTEM PROMPT (excerpt) ===
{excerpt}..."#,
        label = input.label,
        occasions = occasions,
        avg_rating = input.avg_rating,
        sample_size = input.sample_size,
        excerpt = excerpt
    )
}

/// Everything the meta-generation prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct MetaPromptInput<'a> {
    pub metrics_section: String,
    pub weaknesses: &'a [String],
    pub low_performing: &'a [String],
    pub calibration_issues: &'a [String],
    pub rules: &'a [DiscoveredRule],
}

/// Build the instruction for authoring an improved variant.
pub fn build_meta_prompt(input: &MetaPromptInput<'_>) -> String {
    let weaknesses = if input.weaknesses.is_empty() {
        "No major weaknesses identified. Focus on incremental refinement.".to_string()
    } else {
        input
            .weaknesses
            .iter()
            .map(|w| format!("- {}", w))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let rules = if input.rules.is_empty() {
        String::new()
    } else {
        let listed = input
            .rules
            .iter()
            .map(|r| {
                format!(
                    "- [{}] {} (confidence {:.0}%, evidence: {})",
                    r.category,
                    r.rule,
                    r.confidence * 100.0,
                    r.evidence
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("\nDISCOVERED RULES (incorporate these):\n{}\n", listed)
    };

    let low_performing = if input.low_performing.is_empty() {
        "None identified".to_string()
    } else {
        input.low_performing.join(", ")
    };

    let calibration = if input.calibration_issues.is_empty() {
        "None. Generated scores and community consensus are aligned.".to_string()
    } else {
        input.calibration_issues.join("; ")
    };

    format!(
        r#"You are an expert prompt engineer for a personal styling feedback engine.

Your task: improve the system prompt below. The change must be TARGETED: fix the listed weaknesses and keep everything that already works.

CURRENT PERFORMANCE METRICS:
{metrics}

IDENTIFIED WEAKNESSES (fix these):
{weaknesses}
{rules}
LOW-PERFORMING OCCASIONS: {low_performing}

CALIBRATION ISSUES: {calibration}

RULES FOR IMPROVEMENT:
1. Preserve the exact JSON output structure (overallScore, summary, whatsWorking, consider, quickFixes, occasionMatch, styleDNA)
2. Preserve the warm, supportive voice
3. Preserve existing fashion knowledge users find helpful
4. Add knowledge for every discovered rule
5. Strengthen guidance for low-performing occasions with concrete examples
6. Adjust scoring guidance if there are calibration issues
7. Keep the same section headings (PERSONALITY:, RESPONSE FORMAT:, ...)
8. Do not remove sections; only improve, expand or add

OUTPUT: Return ONLY the complete improved system prompt. No preamble, no code fences, no explanation."#,
        metrics = input.metrics_section,
        weaknesses = weaknesses,
        rules = rules,
        low_performing = low_performing,
        calibration = calibration
    )
}
