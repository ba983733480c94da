//! Lightweight IoU tracker.
//!
//! Assigns stable ids to detections from backends that do not track on their
//! own. Matching is greedy by descending IoU within the same class. A track
//! only stamps its id after `min_hits` consecutive matches, so single-frame
//! flicker stays "pending" and is never counted. A confirmed track survives
//! up to `max_age` missed frames. Ids are never reused.

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug)]
pub struct TrackerConfig {
    pub iou_threshold: f32,
    pub min_hits: u32,
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            min_hits: 2,
            max_age: 3,
        }
    }
}

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    class: ObjectClass,
    hits: u32,
    misses: u32,
}

impl Track {
    fn confirmed(&self, min_hits: u32) -> bool {
        self.hits >= min_hits
    }
}

#[derive(Debug)]
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Match this frame's detections against live tracks and stamp ids.
    pub fn update(&mut self, mut detections: Vec<Detection>) -> Vec<Detection> {
        let mut candidates = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if det.class != track.class {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.iou_threshold {
                    candidates.push((iou, ti, di));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_match: Vec<Option<usize>> = vec![None; detections.len()];
        for (_, ti, di) in candidates {
            if track_taken[ti] || det_match[di].is_some() {
                continue;
            }
            track_taken[ti] = true;
            det_match[di] = Some(ti);
        }

        let min_hits = self.config.min_hits;
        let max_age = self.config.max_age;
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if track_taken[ti] {
                continue;
            }
            // Tentative tracks die on their first miss.
            track.misses = if track.confirmed(min_hits) {
                track.misses + 1
            } else {
                max_age + 1
            };
        }

        for (di, det) in detections.iter_mut().enumerate() {
            let ti = match det_match[di] {
                Some(ti) => {
                    let track = &mut self.tracks[ti];
                    track.bbox = det.bbox;
                    track.hits += 1;
                    track.misses = 0;
                    ti
                }
                None => {
                    self.tracks.push(Track {
                        id: self.next_id,
                        bbox: det.bbox,
                        class: det.class,
                        hits: 1,
                        misses: 0,
                    });
                    self.next_id += 1;
                    self.tracks.len() - 1
                }
            };
            let track = &self.tracks[ti];
            det.track_id = track.confirmed(min_hits).then_some(track.id);
        }

        self.tracks.retain(|t| t.misses <= max_age);
        detections
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

/// Decorates a detector with an `IouTracker`.
pub struct TrackingBackend<B> {
    inner: B,
    tracker: IouTracker,
}

impl<B: DetectorBackend> TrackingBackend<B> {
    pub fn new(inner: B, config: TrackerConfig) -> Self {
        Self {
            inner,
            tracker: IouTracker::new(config),
        }
    }
}

impl<B: DetectorBackend> DetectorBackend for TrackingBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn tracks_objects(&self) -> bool {
        true
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let detections = self.inner.detect(frame)?;
        Ok(self.tracker.update(detections))
    }

    fn warm_up(&mut self) -> Result<()> {
        self.inner.warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn car(x: f32) -> Detection {
        Detection::new(
            BoundingBox::new(x, 10.0, x + 40.0, 40.0),
            ObjectClass::Car,
            0.9,
        )
    }

    #[test]
    fn id_is_pending_until_confirmed() {
        let mut tracker = IouTracker::default();
        let first = tracker.update(vec![car(0.0)]);
        assert_eq!(first[0].track_id, None);
        let second = tracker.update(vec![car(4.0)]);
        assert_eq!(second[0].track_id, Some(1));
        let third = tracker.update(vec![car(8.0)]);
        assert_eq!(third[0].track_id, Some(1));
    }

    #[test]
    fn separate_objects_get_separate_ids() {
        let mut tracker = IouTracker::default();
        tracker.update(vec![car(0.0), car(200.0)]);
        let out = tracker.update(vec![car(2.0), car(202.0)]);
        assert_eq!(out[0].track_id, Some(1));
        assert_eq!(out[1].track_id, Some(2));
    }

    #[test]
    fn classes_never_match_each_other() {
        let mut tracker = IouTracker::default();
        tracker.update(vec![car(0.0)]);
        let mut truck = car(0.0);
        truck.class = ObjectClass::Truck;
        let out = tracker.update(vec![truck]);
        assert_eq!(out[0].track_id, None);
        assert_eq!(tracker.live_tracks(), 1);
    }

    #[test]
    fn stale_tracks_expire_and_ids_are_not_reused() {
        let mut tracker = IouTracker::new(TrackerConfig {
            max_age: 1,
            ..TrackerConfig::default()
        });
        tracker.update(vec![car(0.0)]);
        tracker.update(vec![car(0.0)]);
        tracker.update(vec![]);
        tracker.update(vec![]);
        assert_eq!(tracker.live_tracks(), 0);
        tracker.update(vec![car(0.0)]);
        let out = tracker.update(vec![car(0.0)]);
        assert_eq!(out[0].track_id, Some(2));
    }
}
