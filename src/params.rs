//! Parameter Arena
//!
//! Every trainable tensor of the model lives in a [`ParamStore`] and is
//! addressed by a [`ParamId`], a stable integer handle handed out when the
//! model is constructed. Layers keep only their handles; forward passes read
//! values from the store and backward passes accumulate gradients into it.
//!
//! The optimizer keys its per-parameter moment state on the same handles, so
//! state follows a parameter's identity rather than its value.
//!
//! ## Gradient lifecycle
//!
//! ```text
//! zero_grad()            every gradient -> None
//! backward (task 1)      grad = g1
//! backward (task 2)      grad = g1 + g2
//! backward (task 3)      grad = g1 + g2 + g3
//! optimizer.step()       reads grad, leaves it in place
//! ```

use crate::tensor::Tensor;

/// Stable handle of a parameter inside a [`ParamStore`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub(crate) usize);

impl ParamId {
    /// Position of the parameter in registration order
    pub fn index(self) -> usize {
        self.0
    }
}

/// Gradient of a single parameter
#[derive(Clone, Debug, PartialEq)]
pub enum Gradient {
    /// Gradient with the full shape of the parameter
    Dense(Tensor),
    /// Row-sparse gradient: `values` row `i` belongs to parameter row `rows[i]`
    ///
    /// Produced by embedding tables configured for sparse updates. Rows may
    /// repeat; repeated rows add up when densified.
    Sparse { rows: Vec<usize>, values: Tensor },
}

impl Gradient {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse { .. })
    }

    /// Materialise as a dense tensor of the given parameter shape
    pub fn to_dense(&self, shape: &[usize]) -> Tensor {
        match self {
            Gradient::Dense(t) => t.clone(),
            Gradient::Sparse { rows, values } => {
                let mut dense = Tensor::zeros(shape.to_vec());
                let cols = dense.cols();
                for (i, &row) in rows.iter().enumerate() {
                    let target = &mut dense.data[row * cols..(row + 1) * cols];
                    for (t, &v) in target.iter_mut().zip(values.row(i)) {
                        *t += v;
                    }
                }
                dense
            }
        }
    }

    /// Add another gradient for the same parameter
    ///
    /// Sparse + sparse stays sparse; any mix with a dense gradient densifies.
    fn accumulate(self, other: Gradient, shape: &[usize]) -> Gradient {
        match (self, other) {
            (Gradient::Dense(mut a), Gradient::Dense(b)) => {
                a.add_assign(&b);
                Gradient::Dense(a)
            }
            (
                Gradient::Sparse {
                    mut rows,
                    values: a,
                },
                Gradient::Sparse {
                    rows: more_rows,
                    values: b,
                },
            ) => {
                rows.extend(more_rows);
                let cols = a.cols();
                let mut data = a.data;
                data.extend(b.data);
                let n = rows.len();
                Gradient::Sparse {
                    rows,
                    values: Tensor::new(data, vec![n, cols]),
                }
            }
            (a, b) => {
                let mut dense = a.to_dense(shape);
                dense.add_assign(&b.to_dense(shape));
                Gradient::Dense(dense)
            }
        }
    }
}

/// A named trainable tensor with its accumulated gradient
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Option<Gradient>,
    /// Frozen parameters never record gradients
    pub requires_grad: bool,
}

/// Arena owning every parameter of a model
#[derive(Clone, Debug, Default)]
pub struct ParamStore {
    params: Vec<Parameter>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new trainable parameter and return its handle
    pub fn register(&mut self, name: impl Into<String>, value: Tensor) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Parameter {
            name: name.into(),
            value,
            grad: None,
            requires_grad: true,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, id: ParamId) -> &Parameter {
        &self.params[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut Parameter {
        &mut self.params[id.0]
    }

    /// Current value of a parameter
    pub fn value(&self, id: ParamId) -> &Tensor {
        &self.params[id.0].value
    }

    /// Current gradient of a parameter, if any was recorded
    pub fn grad(&self, id: ParamId) -> Option<&Gradient> {
        self.params[id.0].grad.as_ref()
    }

    pub fn requires_grad(&self, id: ParamId) -> bool {
        self.params[id.0].requires_grad
    }

    /// Enable or disable gradient recording for a set of parameters
    pub fn set_requires_grad(&mut self, ids: &[ParamId], requires_grad: bool) {
        for &id in ids {
            self.params[id.0].requires_grad = requires_grad;
        }
    }

    /// Add a dense gradient contribution
    ///
    /// Ignored for frozen parameters.
    pub fn accumulate_grad(&mut self, id: ParamId, grad: Tensor) {
        self.accumulate(id, Gradient::Dense(grad));
    }

    /// Add a gradient contribution of either kind
    ///
    /// # Panics
    ///
    /// Panics if a dense gradient's shape differs from the parameter's.
    pub fn accumulate(&mut self, id: ParamId, grad: Gradient) {
        let param = &mut self.params[id.0];
        if !param.requires_grad {
            return;
        }
        if let Gradient::Dense(t) = &grad {
            assert_eq!(
                t.shape, param.value.shape,
                "Gradient shape mismatch for parameter `{}`",
                param.name
            );
        }
        param.grad = Some(match param.grad.take() {
            None => grad,
            Some(existing) => existing.accumulate(grad, &param.value.shape),
        });
    }

    /// Drop every accumulated gradient
    pub fn zero_grad(&mut self) {
        for param in &mut self.params {
            param.grad = None;
        }
    }

    /// Total number of scalar values across all parameters
    pub fn num_values(&self) -> usize {
        self.params.iter().map(|p| p.value.len()).sum()
    }

    /// Number of scalar values that currently record gradients
    pub fn num_trainable_values(&self) -> usize {
        self.params
            .iter()
            .filter(|p| p.requires_grad)
            .map(|p| p.value.len())
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &Parameter)> {
        self.params.iter().enumerate().map(|(i, p)| (ParamId(i), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Parameter)> {
        self.params
            .iter_mut()
            .enumerate()
            .map(|(i, p)| (ParamId(i), p))
    }
}
