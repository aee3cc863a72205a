//! Vision content detection.
//!
//! Scans request parts for inline image blobs and image file references.
//! Remote file references count as images but contribute zero bytes.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::genai::Content;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VisionStats {
    pub has_vision_content: bool,
    pub image_count: usize,
    pub total_bytes: usize,
    /// Distinct media types, in first-seen order.
    pub media_types: Vec<String>,
}

impl VisionStats {
    fn record(&mut self, mime_type: &str, bytes: usize) {
        self.has_vision_content = true;
        self.image_count += 1;
        self.total_bytes += bytes;
        if !self.media_types.iter().any(|m| m == mime_type) {
            self.media_types.push(mime_type.to_string());
        }
    }

    /// Metering `attributes` entries, or `None` when no image was seen.
    pub fn to_attributes(&self) -> Option<Map<String, Value>> {
        if !self.has_vision_content {
            return None;
        }
        let mut attrs = Map::new();
        attrs.insert("vision_image_count".into(), json!(self.image_count));
        attrs.insert("vision_total_size_bytes".into(), json!(self.total_bytes));
        attrs.insert("vision_media_types".into(), json!(self.media_types));
        Some(attrs)
    }
}

fn is_image_mime_type(mime_type: &str) -> bool {
    mime_type.to_ascii_lowercase().starts_with("image/")
}

pub fn detect_vision_content(contents: &[Content]) -> VisionStats {
    let mut stats = VisionStats::default();
    for part in contents.iter().flat_map(|c| c.parts.iter()) {
        if let Some(blob) = &part.inline_data {
            if is_image_mime_type(&blob.mime_type) {
                stats.record(&blob.mime_type, blob.data.len());
            }
        }
        if let Some(file) = &part.file_data {
            if is_image_mime_type(&file.mime_type) {
                stats.record(&file.mime_type, 0);
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genai::Part;

    #[test]
    fn no_content_means_no_vision() {
        let stats = detect_vision_content(&[]);
        assert!(!stats.has_vision_content);
        assert_eq!(stats.image_count, 0);
        assert!(stats.to_attributes().is_none());

        let text_only = [Content::user_text("describe nothing")];
        assert_eq!(detect_vision_content(&text_only), VisionStats::default());
    }

    #[test]
    fn counts_inline_and_file_images() {
        let contents = [Content::new(
            "user",
            vec![
                Part::text("what is in these?"),
                Part::inline_data("image/png", vec![0u8; 1024]),
                Part::inline_data("IMAGE/JPEG", vec![0u8; 10]),
                Part::file_data("image/png", "gs://bucket/cat.png"),
                Part::inline_data("audio/wav", vec![0u8; 4096]),
                Part::file_data("application/pdf", "gs://bucket/doc.pdf"),
            ],
        )];
        let stats = detect_vision_content(&contents);
        assert!(stats.has_vision_content);
        assert_eq!(stats.image_count, 3);
        assert_eq!(stats.total_bytes, 1034);
        assert_eq!(stats.media_types, vec!["image/png", "IMAGE/JPEG"]);
    }

    #[test]
    fn attribute_keys() {
        let contents = [Content::new(
            "user",
            vec![Part::inline_data("image/png", vec![1u8; 1024])],
        )];
        let attrs = detect_vision_content(&contents).to_attributes().unwrap();
        assert_eq!(attrs["vision_image_count"], 1);
        assert_eq!(attrs["vision_total_size_bytes"], 1024);
        assert_eq!(attrs["vision_media_types"], json!(["image/png"]));
    }
}
