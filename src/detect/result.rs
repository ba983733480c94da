use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Axis-aligned box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let iy = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Scale both axes, e.g. from model input space back to frame space.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }
}

/// Closed set of object classes the engine counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectClass {
    Person,
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 6] = [
        ObjectClass::Person,
        ObjectClass::Bicycle,
        ObjectClass::Car,
        ObjectClass::Motorcycle,
        ObjectClass::Bus,
        ObjectClass::Truck,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ObjectClass::Person => "PERSON",
            ObjectClass::Bicycle => "BICYCLE",
            ObjectClass::Car => "CAR",
            ObjectClass::Motorcycle => "MOTORCYCLE",
            ObjectClass::Bus => "BUS",
            ObjectClass::Truck => "TRUCK",
        }
    }

    /// Map a COCO-80 class index onto the counted set.
    pub fn from_coco(index: usize) -> Option<Self> {
        match index {
            0 => Some(ObjectClass::Person),
            1 => Some(ObjectClass::Bicycle),
            2 => Some(ObjectClass::Car),
            3 => Some(ObjectClass::Motorcycle),
            5 => Some(ObjectClass::Bus),
            7 => Some(ObjectClass::Truck),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One object reported for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    pub confidence: f32,
    /// Stable while the tracker keeps the object; `None` until confirmed.
    pub track_id: Option<u64>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class: ObjectClass, confidence: f32) -> Self {
        Self {
            bbox,
            class,
            confidence,
            track_id: None,
        }
    }

    pub fn with_track_id(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    /// Overlay caption: `CAR #12`, or `CAR ?` while tracking is pending.
    pub fn label(&self) -> String {
        match self.track_id {
            Some(id) => format!("{} #{}", self.class, id),
            None => format!("{} ?", self.class),
        }
    }
}

/// Per-class object counts. Every class is always present on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClassCounts {
    #[serde(rename = "PERSON")]
    pub person: u32,
    #[serde(rename = "BICYCLE")]
    pub bicycle: u32,
    #[serde(rename = "CAR")]
    pub car: u32,
    #[serde(rename = "MOTORCYCLE")]
    pub motorcycle: u32,
    #[serde(rename = "BUS")]
    pub bus: u32,
    #[serde(rename = "TRUCK")]
    pub truck: u32,
}

impl ClassCounts {
    pub fn get(&self, class: ObjectClass) -> u32 {
        match class {
            ObjectClass::Person => self.person,
            ObjectClass::Bicycle => self.bicycle,
            ObjectClass::Car => self.car,
            ObjectClass::Motorcycle => self.motorcycle,
            ObjectClass::Bus => self.bus,
            ObjectClass::Truck => self.truck,
        }
    }

    pub fn add(&mut self, class: ObjectClass) {
        let slot = match class {
            ObjectClass::Person => &mut self.person,
            ObjectClass::Bicycle => &mut self.bicycle,
            ObjectClass::Car => &mut self.car,
            ObjectClass::Motorcycle => &mut self.motorcycle,
            ObjectClass::Bus => &mut self.bus,
            ObjectClass::Truck => &mut self.truck,
        };
        *slot += 1;
    }

    pub fn total(&self) -> u32 {
        ObjectClass::ALL.iter().map(|c| self.get(*c)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Human summary of the non-zero classes, e.g. `2 CAR, 1 TRUCK`.
    pub fn summary(&self) -> String {
        ObjectClass::ALL
            .iter()
            .filter(|c| self.get(**c) > 0)
            .map(|c| format!("{} {}", self.get(*c), c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Output of one inference cycle.
#[derive(Clone, Debug, Default)]
pub struct DetectionSet {
    pub detections: Vec<Detection>,
    pub counts: ClassCounts,
}

impl DetectionSet {
    pub fn new(detections: Vec<Detection>) -> Self {
        let mut counts = ClassCounts::default();
        for det in &detections {
            counts.add(det.class);
        }
        Self { detections, counts }
    }

    /// Ids of detections the tracker has confirmed. Pending ones are excluded.
    pub fn track_ids(&self) -> BTreeSet<u64> {
        self.detections.iter().filter_map(|d| d.track_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
        let half = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-5);
    }

    #[test]
    fn new_normalises_corner_order() {
        let b = BoundingBox::new(10.0, 8.0, 2.0, 4.0);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (2.0, 4.0, 10.0, 8.0));
    }

    #[test]
    fn detection_set_counts_and_ids() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        let set = DetectionSet::new(vec![
            Detection::new(bbox, ObjectClass::Car, 0.9).with_track_id(4),
            Detection::new(bbox, ObjectClass::Car, 0.8),
            Detection::new(bbox, ObjectClass::Truck, 0.7).with_track_id(9),
        ]);
        assert_eq!(set.counts.car, 2);
        assert_eq!(set.counts.truck, 1);
        assert_eq!(set.track_ids().into_iter().collect::<Vec<_>>(), vec![4, 9]);
        assert_eq!(set.counts.summary(), "2 CAR, 1 TRUCK");
    }

    #[test]
    fn labels_mark_pending_tracks() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(Detection::new(bbox, ObjectClass::Bus, 0.5).label(), "BUS ?");
        assert_eq!(
            Detection::new(bbox, ObjectClass::Bus, 0.5)
                .with_track_id(3)
                .label(),
            "BUS #3"
        );
    }

    #[test]
    fn counts_serialise_every_class() {
        let value = serde_json::to_value(ClassCounts::default()).unwrap();
        for class in ObjectClass::ALL {
            assert_eq!(value[class.label()], 0);
        }
    }
}
