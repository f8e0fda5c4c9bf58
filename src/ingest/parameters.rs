//! Splits the free-form generation-parameter text embedded in an image into
//! named fields.
//!
//! The text follows an informal convention rather than a grammar:
//!
//! ```text
//! <positive prompt>
//! Negative prompt: <negative prompt>
//! Steps: 20, Sampler: Euler a, CFG scale: 7, Seed: 42, Size: 512x512, ...
//! ```
//!
//! Both marker lines are optional. Everything from `Steps:` on is a
//! `key: value` list joined with `", "`.

use tracing::{debug, warn};

use crate::ingest::record::fields;

pub const NEGATIVE_PROMPT_MARKER: &str = "Negative prompt:";
pub const STEPS_MARKER: &str = "Steps:";
const SEGMENT_DELIMITER: &str = ", ";
const KEY_VALUE_DELIMITER: &str = ": ";

/// Raw keys whose field name differs from their PascalCase form.
const KEY_ALIASES: &[(&str, &str)] = &[("Size", fields::IMAGE_SIZE)];

/// Fields filled by the marker scan; tail segments never overwrite them.
const MARKER_FIELDS: &[&str] = &[fields::POSITIVE_PROMPT, fields::NEGATIVE_PROMPT, fields::STEPS];

/// Ordered field name to value mapping produced from one blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedParameters {
    fields: Vec<(String, String)>,
    dropped: Vec<String>,
}

impl ParsedParameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Tail segments that had no `key: value` shape.
    pub fn dropped_segments(&self) -> &[String] {
        &self.dropped
    }

    /// Later writes to the same key replace the value but keep its position.
    fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| *name == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }
}

/// Map a raw tail key such as `CFG scale` to its field name (`CFGScale`).
pub fn field_name_for(raw_key: &str) -> String {
    let key = raw_key.trim();
    if let Some((_, alias)) = KEY_ALIASES.iter().find(|(raw, _)| *raw == key) {
        return alias.to_string();
    }
    key.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

pub fn parse_parameters(blob: &str) -> ParsedParameters {
    let mut parsed = ParsedParameters::default();

    match (blob.find(NEGATIVE_PROMPT_MARKER), blob.find(STEPS_MARKER)) {
        (Some(negative_at), _) => {
            parsed.set(fields::POSITIVE_PROMPT, blob[..negative_at].trim());

            let after_marker = &blob[negative_at + NEGATIVE_PROMPT_MARKER.len()..];
            match after_marker.find(STEPS_MARKER) {
                Some(steps_at) => {
                    parsed.set(fields::NEGATIVE_PROMPT, after_marker[..steps_at].trim());
                    parse_steps_section(&after_marker[steps_at..], &mut parsed);
                }
                None => parsed.set(fields::NEGATIVE_PROMPT, after_marker.trim()),
            }
        }
        (None, Some(steps_at)) => {
            parsed.set(fields::POSITIVE_PROMPT, blob[..steps_at].trim());
            parse_steps_section(&blob[steps_at..], &mut parsed);
        }
        (None, None) => parsed.set(fields::POSITIVE_PROMPT, blob.trim()),
    }

    parsed
}

fn parse_steps_section(section: &str, parsed: &mut ParsedParameters) {
    let section = section.trim_end();
    parsed.set(fields::STEPS, section);

    for segment in section.split(SEGMENT_DELIMITER) {
        let Some((raw_key, value)) = segment.split_once(KEY_VALUE_DELIMITER) else {
            drop_segment(segment, parsed);
            continue;
        };

        let name = field_name_for(raw_key);
        if name.is_empty() {
            drop_segment(segment, parsed);
            continue;
        }
        if MARKER_FIELDS.contains(&name.as_str()) {
            debug!(field = %name, value = value.trim(), "Tail key shadows a marker field, skipping");
            continue;
        }
        parsed.set(name, value.trim());
    }
}

fn drop_segment(segment: &str, parsed: &mut ParsedParameters) {
    warn!(segment, "Invalid key-value segment, ignoring");
    parsed.dropped.push(segment.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_both_markers() {
        let parsed = parse_parameters(
            "cat photo\nNegative prompt: blurry\nSteps: 20, Sampler: Euler, CFG scale: 7",
        );
        assert_eq!(parsed.get("PositivePrompt"), Some("cat photo"));
        assert_eq!(parsed.get("NegativePrompt"), Some("blurry"));
        assert!(parsed.get("Steps").unwrap().starts_with("Steps: 20, "));
        assert_eq!(parsed.get("Sampler"), Some("Euler"));
        assert_eq!(parsed.get("CFGScale"), Some("7"));
        assert!(parsed.dropped_segments().is_empty());
    }

    #[test]
    fn test_steps_marker_only() {
        let parsed = parse_parameters("a tree\nSteps: 15, Seed: 42");
        assert_eq!(parsed.get("PositivePrompt"), Some("a tree"));
        assert_eq!(parsed.get("NegativePrompt"), None);
        assert_eq!(parsed.get("Seed"), Some("42"));
        assert_eq!(parsed.get("Steps"), Some("Steps: 15, Seed: 42"));
    }

    #[test]
    fn test_no_markers() {
        let blob = "just a caption, no markers";
        let parsed = parse_parameters(blob);
        assert_eq!(parsed.get("PositivePrompt"), Some(blob));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_empty_blob() {
        let parsed = parse_parameters("");
        assert_eq!(parsed.get("PositivePrompt"), Some(""));
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_malformed_segment_is_dropped() {
        let parsed = parse_parameters("Steps: 10, BadSegmentNoColon, Seed: 5");
        assert_eq!(parsed.get("Seed"), Some("5"));
        assert_eq!(parsed.get("PositivePrompt"), Some(""));
        assert_eq!(parsed.dropped_segments(), ["BadSegmentNoColon".to_string()]);
    }

    #[test]
    fn test_tail_keys_do_not_replace_marker_fields() {
        let parsed = parse_parameters(
            "cat\nNegative prompt: dog\nSteps: 1, Positive prompt: EVIL, Negative prompt: BAD, Seed: 3",
        );
        assert_eq!(parsed.get("PositivePrompt"), Some("cat"));
        assert_eq!(parsed.get("NegativePrompt"), Some("dog"));
        assert!(parsed.get("Steps").unwrap().starts_with("Steps: 1, Positive prompt: EVIL"));
        assert_eq!(parsed.get("Seed"), Some("3"));
        assert!(parsed.dropped_segments().is_empty());

        let parsed = parse_parameters("tree\nSteps: 2, Positive prompt: other");
        assert_eq!(parsed.get("PositivePrompt"), Some("tree"));
    }

    #[test]
    fn test_negative_prompt_without_steps() {
        let parsed = parse_parameters("castle\nNegative prompt:  lowres, jpeg artifacts \n");
        assert_eq!(parsed.get("PositivePrompt"), Some("castle"));
        assert_eq!(parsed.get("NegativePrompt"), Some("lowres, jpeg artifacts"));
        assert_eq!(parsed.get("Steps"), None);
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_steps_before_negative_marker_is_not_parsed() {
        let parsed = parse_parameters("Steps: 5 then\nNegative prompt: ugly");
        assert_eq!(parsed.get("PositivePrompt"), Some("Steps: 5 then"));
        assert_eq!(parsed.get("NegativePrompt"), Some("ugly"));
        assert_eq!(parsed.get("Steps"), None);
    }

    #[test]
    fn test_later_duplicate_key_wins() {
        let parsed = parse_parameters("x\nSteps: 1, Seed: 1, Sampler: DDIM, Seed: 2");
        assert_eq!(parsed.get("Seed"), Some("2"));
        let order: Vec<&str> = parsed.fields().map(|(k, _)| k).collect();
        assert_eq!(order, ["PositivePrompt", "Steps", "Seed", "Sampler"]);
    }

    #[test]
    fn test_full_a1111_tail() {
        let blob = "masterpiece, 1girl\nNegative prompt: bad hands\n\
                    Steps: 28, Sampler: DPM++ 2M Karras, CFG scale: 6.5, Seed: 1234, \
                    Size: 512x768, Model hash: 6ce0161689, Model: v1-5-pruned, \
                    Seed resize from: 512x512, Denoising strength: 0.4, Version: v1.6.0\n";
        let parsed = parse_parameters(blob);
        assert_eq!(parsed.get("PositivePrompt"), Some("masterpiece, 1girl"));
        assert_eq!(parsed.get("Sampler"), Some("DPM++ 2M Karras"));
        assert_eq!(parsed.get("CFGScale"), Some("6.5"));
        assert_eq!(parsed.get("ImageSize"), Some("512x768"));
        assert_eq!(parsed.get("ModelHash"), Some("6ce0161689"));
        assert_eq!(parsed.get("Model"), Some("v1-5-pruned"));
        assert_eq!(parsed.get("SeedResizeFrom"), Some("512x512"));
        assert_eq!(parsed.get("DenoisingStrength"), Some("0.4"));
        assert_eq!(parsed.get("Version"), Some("v1.6.0"));
        assert!(parsed.get("Steps").unwrap().ends_with("Version: v1.6.0"));
    }

    #[test]
    fn test_value_keeps_text_after_first_separator() {
        let parsed = parse_parameters("p\nSteps: 3, Note: a: b");
        assert_eq!(parsed.get("Note"), Some("a: b"));
    }

    #[test]
    fn test_field_name_for() {
        assert_eq!(field_name_for("CFG scale"), "CFGScale");
        assert_eq!(field_name_for("Size"), "ImageSize");
        assert_eq!(field_name_for("Model hash"), "ModelHash");
        assert_eq!(field_name_for("Denoising strength"), "DenoisingStrength");
        assert_eq!(field_name_for("Clip skip"), "ClipSkip");
        assert_eq!(field_name_for("Hires upscaler"), "HiresUpscaler");
        assert_eq!(field_name_for("---"), "");
    }

    #[test]
    fn test_multibyte_prompt() {
        let parsed = parse_parameters("猫の写真 ✨\nNegative prompt: ぼやけ\nSteps: 20, Seed: 7");
        assert_eq!(parsed.get("PositivePrompt"), Some("猫の写真 ✨"));
        assert_eq!(parsed.get("NegativePrompt"), Some("ぼやけ"));
        assert_eq!(parsed.get("Seed"), Some("7"));
    }

    proptest! {
        #[test]
        fn never_panics_and_prompts_are_trimmed(blob in ".{0,200}") {
            let parsed = parse_parameters(&blob);
            let positive = parsed.get("PositivePrompt").unwrap();
            prop_assert_eq!(positive, positive.trim());
            if let Some(negative) = parsed.get("NegativePrompt") {
                prop_assert_eq!(negative, negative.trim());
            }
        }

        #[test]
        fn marker_text_survives_random_noise(
            prefix in "[a-z ,:]{0,40}",
            noise in "[A-Za-z0-9 ,:]{0,60}",
        ) {
            let blob = format!("{prefix}\nSteps: 9, {noise}");
            let parsed = parse_parameters(&blob);
            prop_assert!(parsed.get("Steps").unwrap().starts_with("Steps: 9"));
        }

        #[test]
        fn well_formed_tail_is_recovered(
            prompt in "[a-z ]{0,30}",
            negative in prop::option::of("[a-z ]{0,30}"),
            pairs in prop::collection::vec(("Key[a-z]{1,6}", "[a-z0-9.]{1,10}"), 0..8),
        ) {
            let tail: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}: {v}")).collect();
            let mut blob = prompt.clone();
            if let Some(negative) = &negative {
                blob.push_str(&format!("\nNegative prompt: {negative}"));
            }
            blob.push_str("\nSteps: 12");
            for segment in &tail {
                blob.push_str(", ");
                blob.push_str(segment);
            }

            let parsed = parse_parameters(&blob);
            prop_assert_eq!(parsed.get("PositivePrompt"), Some(prompt.trim()));
            prop_assert_eq!(parsed.get("NegativePrompt"), negative.as_deref().map(str::trim));
            prop_assert!(parsed.dropped_segments().is_empty());

            let mut expected = std::collections::HashMap::new();
            for (k, v) in &pairs {
                expected.insert(k.clone(), v.clone());
            }
            for (k, v) in &expected {
                prop_assert_eq!(parsed.get(k), Some(v.as_str()));
            }
        }
    }
}
