//! Update candidate selection
//!
//! A container qualifies for a rolling update iff the operator's filter
//! expression matches its image and the image actually differs from the
//! target: by tag, or by image ID when both are known. References pinned
//! to an opaque digest have no tag to roll and are always excluded.

use glob::Pattern;

use crate::containers::ContainerRegistration;

pub struct UpdateFilter {
    pattern: Pattern,
    target_tag: String,
    /// Image ID of the target tag, when the reconciler resolved one.
    latest_image_id: Option<String>,
}

impl UpdateFilter {
    pub fn new(
        expression: &str,
        target_tag: &str,
        latest_image_id: Option<String>,
    ) -> Result<Self, String> {
        let pattern = Pattern::new(expression)
            .map_err(|e| format!("bad filter expression {}: {}", expression, e))?;
        Ok(Self {
            pattern,
            target_tag: target_tag.to_string(),
            latest_image_id,
        })
    }

    pub fn accepts(&self, registration: &ContainerRegistration) -> bool {
        let image = registration.image_ref();
        if image.is_digest_pinned() {
            return false;
        }
        if !self.pattern.matches(&registration.image)
            && !self.pattern.matches(&image.repository())
        {
            return false;
        }

        if image.tag.as_deref() != Some(self.target_tag.as_str()) {
            return true;
        }
        match (&self.latest_image_id, &registration.image_id) {
            (Some(latest), Some(current)) => latest != current,
            _ => false,
        }
    }
}
