#![deny(missing_docs)]
//! # rankfm
//!
//! `rankfm` implements factorization machines for ranking problems with
//! implicit feedback data: given only the items users have interacted with
//! (and, optionally, user and item side features), the model learns to rank
//! items each user is likely to interact with next.
//!
//! Training uses pairwise learning-to-rank with a logistic loss: every
//! observed (user, item) pair is contrasted against a sampled item the user
//! has not interacted with, and a stochastic gradient step is taken on the
//! score margin between the two.
//!
//! ## Example
//! ```rust
//! # extern crate rankfm;
//! # extern crate rand_xorshift;
//! # extern crate rand;
//! use rand::SeedableRng;
//! use rand_xorshift::XorShiftRng;
//!
//! use rankfm::data::{Interaction, Interactions};
//! use rankfm::models::fm::Hyperparameters;
//! use rankfm::models::ColdStart;
//!
//! let interactions: Vec<Interaction> = vec![(0, 0), (0, 1), (1, 2), (2, 3)]
//!     .into_iter()
//!     .map(|(user_id, item_id)| Interaction::new(user_id, item_id))
//!     .collect();
//! let interactions = Interactions::from(interactions);
//!
//! let mut model = Hyperparameters::new(2)
//!     .learning_rate(0.1)
//!     .rng(XorShiftRng::from_seed([42; 16]))
//!     .build()
//!     .unwrap();
//!
//! model.fit(&interactions, None, None, 5, false).unwrap();
//!
//! let recommendations = model.recommend(&[0], 2, true, ColdStart::Nan).unwrap();
//! assert_eq!(recommendations.len(), 1);
//! ```

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;

#[macro_use]
extern crate log;

extern crate ndarray;
extern crate rand;
extern crate rand_distr;
extern crate rand_xorshift;
extern crate rayon;
extern crate serde;

pub mod data;
pub mod evaluation;
pub mod models;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;

/// Invalid hyperparameter errors, raised when building a model.
#[derive(Debug, Fail)]
pub enum ConfigurationError {
    /// The latent factor rank must be at least one.
    #[fail(display = "factor rank must be a positive integer")]
    InvalidFactors,
    /// The L2 penalty must be finite and non-negative.
    #[fail(display = "regularization must be a finite non-negative value")]
    InvalidRegularization,
    /// The initialization standard deviation must be finite and positive.
    #[fail(display = "sigma must be a finite positive value")]
    InvalidSigma,
    /// The learning rate must be finite and positive.
    #[fail(display = "learning rate must be a finite positive value")]
    InvalidLearningRate,
    /// The inverse-scaling exponent must be finite and positive.
    #[fail(display = "learning exponent must be a finite positive value")]
    InvalidLearningExponent,
}

/// Fitting error types. These are all raised before any model weight
/// has been modified, so a failed fit leaves the model unchanged.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were supplied.
    #[fail(display = "no interactions to fit the model on")]
    NoInteractions,
    /// An interaction refers to a user or item outside the index bounds.
    #[fail(display = "interaction indices exceed the user/item index bounds")]
    IndexOutOfBounds,
    /// A feature matrix does not cover the user/item index exactly.
    #[fail(display = "feature rows do not cover the user/item index exactly")]
    FeatureShapeMismatch,
}

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// The model has not been fit yet.
    #[fail(display = "the model must be fit before generating predictions")]
    ModelNotFit,
    /// The queried user or item is not present in the fitted index.
    #[fail(display = "id not present in the fitted model")]
    UnknownId,
}
