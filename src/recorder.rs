use image::{ImageFormat, Rgba};
use image_hasher::{HashAlg, HasherConfig};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::types::{Action, BoundingBox, Perception};

/// Distance added when the element structure differs.
pub const STRUCTURE_PENALTY: u32 = 8;
/// Distance added when the page URL differs.
pub const URL_PENALTY: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub url: String,
    /// Hash of the perceived elements (tags, roles, labels, values).
    pub structure: u64,
    /// Gradient perceptual hash of the screenshot.
    pub visual: Vec<u8>,
}

impl Fingerprint {
    pub fn compute(perception: &Perception, screenshot: &[u8]) -> Result<Self, image::ImageError> {
        Ok(Self {
            url: perception.url.clone(),
            structure: structural_hash(perception),
            visual: visual_hash(screenshot)?,
        })
    }

    pub fn distance(&self, other: &Fingerprint) -> u32 {
        let mut distance = hamming(&self.visual, &other.visual);
        if self.structure != other.structure {
            distance += STRUCTURE_PENALTY;
        }
        if self.url != other.url {
            distance += URL_PENALTY;
        }
        distance
    }

    pub fn is_near(&self, other: &Fingerprint, threshold: u32) -> bool {
        self.distance(other) <= threshold
    }
}

fn structural_hash(perception: &Perception) -> u64 {
    let mut hasher = DefaultHasher::new();
    perception.dialog_open.hash(&mut hasher);
    for el in &perception.elements {
        el.tag.hash(&mut hasher);
        el.role.hash(&mut hasher);
        el.label.hash(&mut hasher);
        el.value.hash(&mut hasher);
    }
    hasher.finish()
}

fn visual_hash(screenshot: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(screenshot)?;
    let hasher = HasherConfig::new().hash_alg(HashAlg::Gradient).to_hasher();
    Ok(hasher.hash_image(&img).as_bytes().to_vec())
}

/// Bit distance between two hashes; missing bytes count as fully different.
fn hamming(a: &[u8], b: &[u8]) -> u32 {
    let common: u32 = a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum();
    common + 8 * a.len().abs_diff(b.len()) as u32
}

/// Perceived UI state at one instant. Discarded unless it becomes a Step.
#[derive(Debug, Clone)]
pub struct UiSnapshot {
    pub perception: Perception,
    pub screenshot: Vec<u8>,
    pub fingerprint: Fingerprint,
}

impl UiSnapshot {
    pub fn new(perception: Perception, screenshot: Vec<u8>) -> Result<Self, CaptureError> {
        let fingerprint = Fingerprint::compute(&perception, &screenshot)
            .map_err(|e| CaptureError::Internal(format!("screenshot could not be decoded: {e}")))?;
        Ok(Self { perception, screenshot, fingerprint })
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub index: usize,
    /// Public, relative path (`screenshots/<ns>/step_000.png`).
    pub path: String,
    pub action: Action,
    /// Label of the element the action touched, if any.
    pub target_label: Option<String>,
    pub url: String,
    pub title: String,
    pub dialog_open: bool,
    pub fingerprint: Fingerprint,
}

/// Owns the task's screenshot directory. Unless [`StepRecorder::finish`] is
/// called, the directory and everything in it is removed on drop.
pub struct StepRecorder {
    dir: PathBuf,
    public_prefix: String,
    namespace: String,
    threshold: u32,
    highlight: bool,
    steps: Vec<Step>,
    kept: bool,
}

impl StepRecorder {
    /// Claim `<root>/<sanitized task_id>`; a random suffix is appended when the
    /// directory already exists so concurrent tasks never share files.
    pub fn create(
        root: &Path,
        public_prefix: &str,
        task_id: &str,
        threshold: u32,
        highlight: bool,
    ) -> Result<Self, CaptureError> {
        fs::create_dir_all(root)?;
        let base = sanitize_namespace(task_id);
        let mut namespace = base.clone();
        loop {
            let dir = root.join(&namespace);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "claimed screenshot directory");
                    return Ok(Self {
                        dir,
                        public_prefix: public_prefix.trim_end_matches('/').to_string(),
                        namespace,
                        threshold,
                        highlight,
                        steps: Vec::new(),
                        kept: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let suffix = uuid::Uuid::new_v4().simple().to_string();
                    namespace = format!("{}-{}", base, &suffix[..8]);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Commit `snapshot` as the next Step if it is distinct or significant.
    pub fn record_if_significant(
        &mut self,
        snapshot: &UiSnapshot,
        action: &Action,
        target: Option<(&str, BoundingBox)>,
    ) -> Result<Option<&Step>, CaptureError> {
        if !self.is_significant(snapshot, action) {
            debug!(action = action.name(), "state unchanged, step deduplicated");
            return Ok(None);
        }
        self.commit(snapshot, action, target).map(Some)
    }

    /// Commit regardless of similarity, unless the state is an exact repeat.
    pub fn record_final(
        &mut self,
        snapshot: &UiSnapshot,
        action: &Action,
    ) -> Result<Option<&Step>, CaptureError> {
        if self.steps.is_empty() {
            return self.commit(snapshot, action, None).map(Some);
        }
        self.record_if_significant(snapshot, action, None)
    }

    fn is_significant(&self, snapshot: &UiSnapshot, action: &Action) -> bool {
        let Some(last) = self.steps.last() else {
            return true;
        };
        let distance = snapshot.fingerprint.distance(&last.fingerprint);
        if distance > self.threshold {
            return true;
        }
        if distance == 0 {
            return false;
        }
        let navigated = snapshot.perception.url != last.url || matches!(action, Action::Navigate { .. });
        let dialog_opened = snapshot.perception.dialog_open && !last.dialog_open;
        navigated || dialog_opened
    }

    fn commit(
        &mut self,
        snapshot: &UiSnapshot,
        action: &Action,
        target: Option<(&str, BoundingBox)>,
    ) -> Result<&Step, CaptureError> {
        let index = self.steps.len();
        let file_name = format!("step_{:03}.png", index);
        let file_path = self.dir.join(&file_name);

        let highlight = target
            .filter(|_| self.highlight && matches!(action, Action::Type { .. }))
            .map(|(_, bbox)| bbox)
            .filter(|bbox| !bbox.is_empty());
        let bytes = match highlight {
            Some(bbox) => highlight_box(&snapshot.screenshot, bbox).unwrap_or_else(|e| {
                warn!("highlight failed, storing raw screenshot: {}", e);
                snapshot.screenshot.clone()
            }),
            None => snapshot.screenshot.clone(),
        };
        fs::write(&file_path, bytes)?;

        let step = Step {
            index,
            path: format!("{}/{}/{}", self.public_prefix, self.namespace, file_name),
            action: action.clone(),
            target_label: target.map(|(label, _)| label.to_string()).filter(|l| !l.is_empty()),
            url: snapshot.perception.url.clone(),
            title: snapshot.perception.title.clone(),
            dialog_open: snapshot.perception.dialog_open,
            fingerprint: snapshot.fingerprint.clone(),
        };
        info!(index, path = %step.path, action = action.name(), "step committed");
        self.steps.push(step);
        Ok(&self.steps[index])
    }

    /// Keep the files and hand over the committed steps.
    pub fn finish(mut self) -> Vec<Step> {
        self.kept = true;
        std::mem::take(&mut self.steps)
    }

    /// Remove every file recorded for this task.
    pub fn discard(self) {
        // Drop does the cleanup.
    }
}

impl Drop for StepRecorder {
    fn drop(&mut self) {
        if !self.kept {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!(dir = %self.dir.display(), "failed to discard screenshots: {}", e);
            } else {
                debug!(dir = %self.dir.display(), "discarded partial screenshots");
            }
        }
    }
}

fn sanitize_namespace(task_id: &str) -> String {
    let cleaned: String = task_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '-').to_string();
    if cleaned.is_empty() { "task".to_string() } else { cleaned }
}

/// Draw a red frame around the element the action touched.
fn highlight_box(png: &[u8], bbox: BoundingBox) -> Result<Vec<u8>, image::ImageError> {
    let mut img = image::load_from_memory(png)?.to_rgba8();
    let red = Rgba([255u8, 0, 0, 255]);
    for inset in 0..3 {
        let x = (bbox.x as i32) - inset;
        let y = (bbox.y as i32) - inset;
        let w = (bbox.w as u32).saturating_add(2 * inset as u32).max(1);
        let h = (bbox.h as u32).saturating_add(2 * inset as u32).max(1);
        draw_hollow_rect_mut(&mut img, Rect::at(x, y).of_size(w, h), red);
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
