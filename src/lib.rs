//! # sph — Sparse Predictive Hierarchy
//!
//! An online sequence-learning engine built from stacks of sparse-coded
//! column grids. Each timestep the hierarchy consumes a tuple of categorical
//! input fields, updates its layers on an exponentially slowed tick
//! schedule, and emits next-step predictions for prediction channels and
//! reward-driven discrete actions for action channels.
//!
//! Learning is fully online and local to each column: the [`encoder`]
//! competitively sparse-codes its inputs, the [`decoder`] trains a
//! per-column softmax classifier one step behind its own forward pass, and
//! the [`actor`] replays a history ring of samples through an advantage
//! actor-critic update. There is no gradient descent through layers.
//!
//! Kernels parallelize over hidden columns with `rayon`; determinism is
//! preserved under any thread count by deriving a per-column RNG substream
//! for every parallel learning pass. See [`helpers::set_num_threads`].
//!
//! ```rust,no_run
//! use sph::helpers::Int3;
//! use sph::hierarchy::{Hierarchy, IoDesc, LayerDesc};
//!
//! let io_descs = vec![IoDesc {
//!     size: Int3::new(2, 2, 16),
//!     ..Default::default()
//! }];
//! let layer_descs = vec![LayerDesc::default(); 2];
//!
//! let mut h = Hierarchy::new(&io_descs, &layer_descs, 1337)?;
//!
//! let input = vec![0i32; 2 * 2];
//! h.step(&[&input], true, 0.0, 0.0)?;
//!
//! let prediction = h.get_prediction_cis(0)?;
//! # Ok::<(), sph::Error>(())
//! ```

pub mod actor;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod helpers;
pub mod hierarchy;

pub use error::{Error, Result};
pub use hierarchy::{Hierarchy, IoDesc, IoType, LayerDesc};
