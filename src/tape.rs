//! Minimal reverse-mode differentiation over dense matrices.
//!
//! The energy predictor needs gradients of a scalar energy with respect to
//! the density matrix, nothing more. Rather than a general autodiff engine,
//! this is a flat tape of matrix operations: matrix products, elementwise
//! arithmetic, a handful of scalar nonlinearities and the reductions the
//! functional layer composes. Every value is a `DMatrix<f64>`; scalars are
//! 1x1 matrices.
//!
//! Nodes created with [`Tape::constant`] are structural stop-gradients:
//! they participate in the forward value but never accumulate an adjoint,
//! so anything computed from frozen reference data stays out of the
//! backward pass by construction.

extern crate nalgebra as na;

use std::cell::RefCell;

use na::DMatrix;

#[derive(Debug, Clone)]
enum Unary {
    Powf(f64),
    Ln,
    Sqrt,
    Abs,
    Tanh,
    Sigmoid,
    Asinh,
}

#[derive(Debug, Clone)]
enum Op {
    Leaf,
    Constant,
    Add(usize, usize),
    Sub(usize, usize),
    Scale(usize, f64),
    Shift(usize, f64),
    Mul(usize, usize),
    Div(usize, usize),
    MatMul(usize, usize),
    /// Row-broadcast addition: `(r, c) + (1, c)`.
    AddRow(usize, usize),
    HStack(Vec<usize>),
    /// Sum over columns, `(r, c) -> (r, 1)`.
    RowSum(usize),
    /// Elementwise dot product, `-> (1, 1)`.
    Dot(usize, usize),
    /// Per-row quadratic form: `y_g = a_g D b_g^T`, `-> (r, 1)`.
    Bilinear(usize, usize, usize),
    Unary(usize, Unary),
}

struct Node {
    value: DMatrix<f64>,
    op: Op,
}

/// Operation tape. One tape per energy evaluation; variables borrow it.
pub struct Tape {
    nodes: RefCell<Vec<Node>>,
}

/// Handle to a tape node. Cheap to copy; arithmetic operators build new nodes.
#[derive(Clone, Copy)]
pub struct Var<'t> {
    tape: &'t Tape,
    idx: usize,
}

impl Tape {
    pub fn new() -> Self {
        Tape {
            nodes: RefCell::new(Vec::new()),
        }
    }

    fn push(&self, value: DMatrix<f64>, op: Op) -> Var<'_> {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(Node { value, op });
        Var {
            tape: self,
            idx: nodes.len() - 1,
        }
    }

    /// Differentiable leaf.
    pub fn var(&self, value: DMatrix<f64>) -> Var<'_> {
        self.push(value, Op::Leaf)
    }

    /// Frozen input: contributes to values, never to gradients.
    pub fn constant(&self, value: DMatrix<f64>) -> Var<'_> {
        self.push(value, Op::Constant)
    }

    /// 1x1 constant.
    pub fn scalar(&self, value: f64) -> Var<'_> {
        self.constant(DMatrix::from_element(1, 1, value))
    }

    pub fn hstack<'t>(&'t self, parts: &[Var<'t>]) -> Var<'t> {
        assert!(!parts.is_empty(), "hstack of zero blocks");
        let nodes = self.nodes.borrow();
        let rows = nodes[parts[0].idx].value.nrows();
        let cols: usize = parts.iter().map(|p| nodes[p.idx].value.ncols()).sum();
        let mut out = DMatrix::zeros(rows, cols);
        let mut offset = 0;
        for p in parts {
            let v = &nodes[p.idx].value;
            assert_eq!(v.nrows(), rows, "hstack row mismatch");
            out.view_mut((0, offset), (rows, v.ncols())).copy_from(v);
            offset += v.ncols();
        }
        drop(nodes);
        self.push(out, Op::HStack(parts.iter().map(|p| p.idx).collect()))
    }

    /// Run reverse accumulation from a scalar output.
    pub fn backward(&self, output: Var<'_>) -> Gradients {
        let nodes = self.nodes.borrow();
        let out = &nodes[output.idx].value;
        assert_eq!(out.shape(), (1, 1), "backward seed must be scalar");

        let mut adj: Vec<Option<DMatrix<f64>>> = vec![None; nodes.len()];
        adj[output.idx] = Some(DMatrix::from_element(1, 1, 1.0));

        // Children always precede parents on the tape, so one reverse sweep
        // visits each node after all of its uses.
        for i in (0..nodes.len()).rev() {
            let Some(grad) = adj[i].take() else { continue };
            let keep = grad.clone();
            match &nodes[i].op {
                Op::Leaf | Op::Constant => {
                    adj[i] = Some(keep);
                    continue;
                }
                Op::Add(a, b) => {
                    accumulate(&nodes, &mut adj, *a, grad.clone());
                    accumulate(&nodes, &mut adj, *b, grad);
                }
                Op::Sub(a, b) => {
                    accumulate(&nodes, &mut adj, *a, grad.clone());
                    accumulate(&nodes, &mut adj, *b, -grad);
                }
                Op::Scale(a, k) => {
                    accumulate(&nodes, &mut adj, *a, grad.scale(*k));
                }
                Op::Shift(a, _) => {
                    accumulate(&nodes, &mut adj, *a, grad);
                }
                Op::Mul(a, b) => {
                    accumulate(&nodes, &mut adj, *a, grad.component_mul(&nodes[*b].value));
                    accumulate(&nodes, &mut adj, *b, grad.component_mul(&nodes[*a].value));
                }
                Op::Div(a, b) => {
                    let bv = &nodes[*b].value;
                    accumulate(&nodes, &mut adj, *a, grad.component_div(bv));
                    let db = -grad
                        .component_mul(&nodes[*a].value)
                        .component_div(&bv.component_mul(bv));
                    accumulate(&nodes, &mut adj, *b, db);
                }
                Op::MatMul(a, b) => {
                    accumulate(&nodes, &mut adj, *a, &grad * nodes[*b].value.transpose());
                    accumulate(&nodes, &mut adj, *b, nodes[*a].value.transpose() * &grad);
                }
                Op::AddRow(a, bias) => {
                    let summed = DMatrix::from_row_slice(1, grad.ncols(), grad.row_sum().as_slice());
                    accumulate(&nodes, &mut adj, *a, grad);
                    accumulate(&nodes, &mut adj, *bias, summed);
                }
                Op::HStack(parts) => {
                    let mut offset = 0;
                    for &p in parts {
                        let c = nodes[p].value.ncols();
                        let block = grad.view((0, offset), (grad.nrows(), c)).into_owned();
                        accumulate(&nodes, &mut adj, p, block);
                        offset += c;
                    }
                }
                Op::RowSum(a) => {
                    let c = nodes[*a].value.ncols();
                    let spread = DMatrix::from_fn(grad.nrows(), c, |r, _| grad[(r, 0)]);
                    accumulate(&nodes, &mut adj, *a, spread);
                }
                Op::Dot(a, b) => {
                    let g = grad[(0, 0)];
                    accumulate(&nodes, &mut adj, *a, nodes[*b].value.scale(g));
                    accumulate(&nodes, &mut adj, *b, nodes[*a].value.scale(g));
                }
                Op::Bilinear(a, d, b) => {
                    let av = &nodes[*a].value;
                    let dv = &nodes[*d].value;
                    let bv = &nodes[*b].value;
                    // Scale each row of a factor by the row's adjoint weight.
                    let weighted = |m: &DMatrix<f64>| {
                        let mut w = m.clone();
                        for g in 0..w.nrows() {
                            let mut row = w.row_mut(g);
                            row *= grad[(g, 0)];
                        }
                        w
                    };
                    let wa = weighted(av);
                    let wb = weighted(bv);
                    accumulate(&nodes, &mut adj, *d, av.transpose() * &wb);
                    accumulate(&nodes, &mut adj, *a, &wb * dv.transpose());
                    accumulate(&nodes, &mut adj, *b, &wa * dv);
                }
                Op::Unary(a, u) => {
                    let x = &nodes[*a].value;
                    let dx = match u {
                        Unary::Powf(p) => x.map(|v| p * v.powf(p - 1.0)),
                        Unary::Ln => x.map(|v| 1.0 / v),
                        Unary::Sqrt => x.map(|v| 0.5 / v.sqrt()),
                        Unary::Abs => x.map(|v| if v < 0.0 { -1.0 } else { 1.0 }),
                        Unary::Tanh => x.map(|v| 1.0 - v.tanh().powi(2)),
                        Unary::Sigmoid => x.map(|v| {
                            let s = 1.0 / (1.0 + (-v).exp());
                            s * (1.0 - s)
                        }),
                        Unary::Asinh => x.map(|v| 1.0 / (1.0 + v * v).sqrt()),
                    };
                    accumulate(&nodes, &mut adj, *a, grad.component_mul(&dx));
                }
            }
        }
        Gradients { adjoints: adj }
    }
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

fn accumulate(
    nodes: &[Node],
    adj: &mut [Option<DMatrix<f64>>],
    idx: usize,
    delta: DMatrix<f64>,
) {
    // Frozen nodes never take part in the backward pass.
    if matches!(nodes[idx].op, Op::Constant) {
        return;
    }
    match &mut adj[idx] {
        Some(existing) => *existing += delta,
        slot @ None => *slot = Some(delta),
    }
}

/// Accumulated adjoints from one backward pass.
pub struct Gradients {
    adjoints: Vec<Option<DMatrix<f64>>>,
}

impl Gradients {
    /// Adjoint of `var`, or zeros if it never received one.
    pub fn wrt(&self, var: Var<'_>, nrows: usize, ncols: usize) -> DMatrix<f64> {
        match &self.adjoints[var.idx] {
            Some(g) => g.clone(),
            None => DMatrix::zeros(nrows, ncols),
        }
    }

    pub fn has_adjoint(&self, var: Var<'_>) -> bool {
        self.adjoints[var.idx].is_some()
    }
}

impl<'t> Var<'t> {
    pub fn value(&self) -> DMatrix<f64> {
        self.tape.nodes.borrow()[self.idx].value.clone()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.tape.nodes.borrow()[self.idx].value.shape()
    }

    fn unary(self, u: Unary) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            let x = &nodes[self.idx].value;
            match &u {
                Unary::Powf(p) => x.map(|v| v.powf(*p)),
                Unary::Ln => x.map(f64::ln),
                Unary::Sqrt => x.map(f64::sqrt),
                Unary::Abs => x.map(f64::abs),
                Unary::Tanh => x.map(f64::tanh),
                Unary::Sigmoid => x.map(|v| 1.0 / (1.0 + (-v).exp())),
                Unary::Asinh => x.map(f64::asinh),
            }
        };
        self.tape.push(v, Op::Unary(self.idx, u))
    }

    pub fn powf(self, p: f64) -> Var<'t> {
        self.unary(Unary::Powf(p))
    }

    pub fn ln(self) -> Var<'t> {
        self.unary(Unary::Ln)
    }

    pub fn sqrt(self) -> Var<'t> {
        self.unary(Unary::Sqrt)
    }

    pub fn abs(self) -> Var<'t> {
        self.unary(Unary::Abs)
    }

    pub fn tanh(self) -> Var<'t> {
        self.unary(Unary::Tanh)
    }

    pub fn sigmoid(self) -> Var<'t> {
        self.unary(Unary::Sigmoid)
    }

    pub fn asinh(self) -> Var<'t> {
        self.unary(Unary::Asinh)
    }

    pub fn scale(self, k: f64) -> Var<'t> {
        let v = self.tape.nodes.borrow()[self.idx].value.scale(k);
        self.tape.push(v, Op::Scale(self.idx, k))
    }

    pub fn shift(self, k: f64) -> Var<'t> {
        let v = self.tape.nodes.borrow()[self.idx].value.add_scalar(k);
        self.tape.push(v, Op::Shift(self.idx, k))
    }

    pub fn matmul(self, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            &nodes[self.idx].value * &nodes[rhs.idx].value
        };
        self.tape.push(v, Op::MatMul(self.idx, rhs.idx))
    }

    /// Row-broadcast addition of a `(1, c)` bias.
    pub fn add_row(self, bias: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            let a = &nodes[self.idx].value;
            let b = &nodes[bias.idx].value;
            assert_eq!(b.nrows(), 1, "bias must be a row vector");
            assert_eq!(a.ncols(), b.ncols(), "bias width mismatch");
            DMatrix::from_fn(a.nrows(), a.ncols(), |r, c| a[(r, c)] + b[(0, c)])
        };
        self.tape.push(v, Op::AddRow(self.idx, bias.idx))
    }

    pub fn row_sum(self) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            // nalgebra: column_sum() sums over columns, giving (r, 1).
            DMatrix::from_column_slice(
                nodes[self.idx].value.nrows(),
                1,
                nodes[self.idx].value.column_sum().as_slice(),
            )
        };
        self.tape.push(v, Op::RowSum(self.idx))
    }

    /// Elementwise dot product; the scalar output that seeds `backward`.
    pub fn dot(self, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            nodes[self.idx].value.dot(&nodes[rhs.idx].value)
        };
        self.tape
            .push(DMatrix::from_element(1, 1, v), Op::Dot(self.idx, rhs.idx))
    }

    /// Single column `j` as an `(r, 1)` node, via a constant selector so the
    /// adjoint routes back through `MatMul`.
    pub fn col(self, j: usize) -> Var<'t> {
        let cols = self.shape().1;
        assert!(j < cols, "column index out of range");
        let mut sel = DMatrix::zeros(cols, 1);
        sel[(j, 0)] = 1.0;
        self.matmul(self.tape.constant(sel))
    }

    /// Per-row quadratic form against a shared middle matrix:
    /// `out_g = rows_g * mid * rows2_g^T`, the density-on-grid primitive.
    pub fn bilinear(self, mid: Var<'t>, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            let a = &nodes[self.idx].value;
            let d = &nodes[mid.idx].value;
            let b = &nodes[rhs.idx].value;
            let t = b * d.transpose();
            DMatrix::from_fn(a.nrows(), 1, |g, _| a.row(g).dot(&t.row(g)))
        };
        self.tape.push(v, Op::Bilinear(self.idx, mid.idx, rhs.idx))
    }
}

impl<'t> std::ops::Add for Var<'t> {
    type Output = Var<'t>;

    fn add(self, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            &nodes[self.idx].value + &nodes[rhs.idx].value
        };
        self.tape.push(v, Op::Add(self.idx, rhs.idx))
    }
}

impl<'t> std::ops::Sub for Var<'t> {
    type Output = Var<'t>;

    fn sub(self, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            &nodes[self.idx].value - &nodes[rhs.idx].value
        };
        self.tape.push(v, Op::Sub(self.idx, rhs.idx))
    }
}

impl<'t> std::ops::Mul for Var<'t> {
    type Output = Var<'t>;

    /// Elementwise (Hadamard) product.
    fn mul(self, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            nodes[self.idx].value.component_mul(&nodes[rhs.idx].value)
        };
        self.tape.push(v, Op::Mul(self.idx, rhs.idx))
    }
}

impl<'t> std::ops::Div for Var<'t> {
    type Output = Var<'t>;

    /// Elementwise division.
    fn div(self, rhs: Var<'t>) -> Var<'t> {
        let v = {
            let nodes = self.tape.nodes.borrow();
            nodes[self.idx].value.component_div(&nodes[rhs.idx].value)
        };
        self.tape.push(v, Op::Div(self.idx, rhs.idx))
    }
}

impl<'t> std::ops::Neg for Var<'t> {
    type Output = Var<'t>;

    fn neg(self) -> Var<'t> {
        self.scale(-1.0)
    }
}
