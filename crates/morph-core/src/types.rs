use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned face box in pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Raw detector output before recognition: box, score and optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Copy scaled to unit L2 norm. A zero vector stays zero.
    pub fn normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Element-wise mean of several embeddings, re-normalised.
    ///
    /// Returns `None` for an empty input or mismatched dimensions.
    pub fn mean<'a>(embeddings: impl IntoIterator<Item = &'a Embedding>) -> Option<Embedding> {
        let mut iter = embeddings.into_iter();
        let first = iter.next()?;
        let mut sum = first.values.clone();
        let mut count = 1usize;
        for embedding in iter {
            if embedding.values.len() != sum.len() {
                return None;
            }
            for (acc, v) in sum.iter_mut().zip(embedding.values.iter()) {
                *acc += v;
            }
            count += 1;
        }
        let values = sum.into_iter().map(|v| v / count as f32).collect();
        Some(
            Embedding {
                values,
                model_version: first.model_version.clone(),
            }
            .normalized(),
        )
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance in [0, 2]. 0 = same identity direction.
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Coarse age groups used by the analyser's age filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeBracket {
    Child,
    Teen,
    Adult,
    Senior,
}

impl AgeBracket {
    pub fn contains(&self, age: u8) -> bool {
        match self {
            AgeBracket::Child => age < 13,
            AgeBracket::Teen => (13..20).contains(&age),
            AgeBracket::Adult => (20..60).contains(&age),
            AgeBracket::Senior => age >= 60,
        }
    }
}

/// Estimated demographic attributes for one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceAttributes {
    pub gender: Gender,
    pub age: u8,
}

/// One detected face instance. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
    /// L2-normalised identity embedding.
    pub embedding: Embedding,
    /// Detector confidence in [0, 1].
    pub score: f32,
    pub attributes: Option<FaceAttributes>,
}

/// Faces from one detector pass, in the order chosen by a [`FaceOrder`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceSet(Vec<Face>);

impl FaceSet {
    pub fn new(faces: Vec<Face>) -> Self {
        Self(faces)
    }

    pub fn faces(&self) -> &[Face] {
        &self.0
    }

    pub fn into_faces(self) -> Vec<Face> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Face> {
        self.0.iter()
    }
}

impl FromIterator<Face> for FaceSet {
    fn from_iter<I: IntoIterator<Item = Face>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a FaceSet {
    type Item = &'a Face;
    type IntoIter = std::slice::Iter<'a, Face>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Ordering policy applied to a detector pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaceOrder {
    #[default]
    LeftRight,
    RightLeft,
    TopBottom,
    BottomTop,
    SmallLarge,
    LargeSmall,
    BestWorst,
    WorstBest,
}

impl FaceOrder {
    pub const ALL: [FaceOrder; 8] = [
        FaceOrder::LeftRight,
        FaceOrder::RightLeft,
        FaceOrder::TopBottom,
        FaceOrder::BottomTop,
        FaceOrder::SmallLarge,
        FaceOrder::LargeSmall,
        FaceOrder::BestWorst,
        FaceOrder::WorstBest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaceOrder::LeftRight => "left-right",
            FaceOrder::RightLeft => "right-left",
            FaceOrder::TopBottom => "top-bottom",
            FaceOrder::BottomTop => "bottom-top",
            FaceOrder::SmallLarge => "small-large",
            FaceOrder::LargeSmall => "large-small",
            FaceOrder::BestWorst => "best-worst",
            FaceOrder::WorstBest => "worst-best",
        }
    }
}

impl fmt::Display for FaceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaceOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaceOrder::ALL
            .into_iter()
            .find(|order| order.as_str() == s)
            .ok_or_else(|| format!("unknown face order '{s}'"))
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            _ => Err(format!("unknown gender '{s}'")),
        }
    }
}

impl FromStr for AgeBracket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child" => Ok(AgeBracket::Child),
            "teen" => Ok(AgeBracket::Teen),
            "adult" => Ok(AgeBracket::Adult),
            "senior" => Ok(AgeBracket::Senior),
            _ => Err(format!("unknown age bracket '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_mean_of_identical_is_identity() {
        let e = Embedding::new(vec![0.6, 0.8]);
        let mean = Embedding::mean([&e, &e, &e]).unwrap();
        assert!(mean.distance(&e).abs() < 1e-6);
    }

    #[test]
    fn test_mean_renormalizes() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let mean = Embedding::mean([&a, &b]).unwrap();
        let expected = std::f32::consts::FRAC_1_SQRT_2;
        assert!((mean.values[0] - expected).abs() < 1e-6);
        assert!((mean.values[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_mean_rejects_empty_and_mismatched() {
        assert!(Embedding::mean(std::iter::empty::<&Embedding>()).is_none());
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0]);
        assert!(Embedding::mean([&a, &b]).is_none());
    }

    #[test]
    fn test_age_brackets_partition() {
        for age in 0..=120u8 {
            let hits = [AgeBracket::Child, AgeBracket::Teen, AgeBracket::Adult, AgeBracket::Senior]
                .iter()
                .filter(|b| b.contains(age))
                .count();
            assert_eq!(hits, 1, "age {age} must fall in exactly one bracket");
        }
    }

    #[test]
    fn test_face_order_parse_roundtrip() {
        for order in FaceOrder::ALL {
            assert_eq!(order.as_str().parse::<FaceOrder>().unwrap(), order);
        }
        assert!("sideways".parse::<FaceOrder>().is_err());
    }

    #[test]
    fn test_bbox_geometry() {
        let b = BoundingBox { x: 10.0, y: 20.0, width: 30.0, height: 40.0 };
        assert_eq!(b.center(), (25.0, 40.0));
        assert_eq!(b.area(), 1200.0);
    }
}
