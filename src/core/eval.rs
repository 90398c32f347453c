// Dense f32 tensors for checking probe graphs against known values.
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, Error> {
        let expected = shape
            .iter()
            .try_fold(1usize, |count, dim| count.checked_mul(*dim))
            .ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("shape {shape:?} has more elements than fit in memory"))
            })?;
        if shape.is_empty() || expected != data.len() {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Builds a tensor from row-major nested rows, e.g. `[[1,2,3],[4,5,6]]`.
    pub fn from_rows<const N: usize>(rows: &[[f32; N]]) -> Result<Self, Error> {
        let data = rows.iter().flatten().copied().collect();
        Self::new(vec![rows.len(), N], data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn zip_with(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor, Error> {
        if self.shape != other.shape {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| f(*a, *b))
            .collect();
        Ok(Tensor {
            shape: self.shape.clone(),
            data,
        })
    }
}
