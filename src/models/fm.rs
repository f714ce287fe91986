//! Factorization machine for ranking with implicit feedback.
//!
//! The model estimates four sets of latent factors of rank F (user, item,
//! user-feature, and item-feature factors) together with item and
//! item-feature biases. The utility of item `i` for user `u` is:
//!
//! ```text
//! s(u, i) = w_i + <x_i, w_if> + <v_u + v_uf^T x_u, v_i + v_if^T x_i>
//! ```
//!
//! where `x_u` and `x_i` are the user's and item's side feature vectors.
//! When no side features are supplied both feature matrices default to a
//! single all-zeros column, so the model reduces to a biased matrix
//! factorization.
//!
//! Training performs one stochastic gradient step per observed interaction
//! and epoch: a presumed-negative item is sampled from outside the user's
//! observed set, and the logistic loss of the score margin between the
//! positive and the negative item is minimized under L2 regularization.

use std::cmp::Ordering;

use ndarray::{Array1, Array2};
use rand::distributions::{Distribution, Uniform};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;

use super::{ColdStart, LearningSchedule};
use data::{CompressedInteractions, Interaction, Interactions};
use {ConfigurationError, FittingError, ItemId, PredictionError, UserId};

/// Attempts the negative sampler makes before giving up on finding an
/// unobserved item. Users who have interacted with nearly the entire
/// catalog can exhaust this budget, in which case the last draw is used
/// even if it is an observed item.
const MAX_SAMPLING_ATTEMPTS: usize = 100;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Log of the sigmoid, computed without overflowing for large `|x|`.
fn log_sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

fn factor_init<R: Rng>(rows: usize, cols: usize, sigma: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| {
        let value: f64 = rng.sample(StandardNormal);
        (value * f64::from(sigma)) as f32
    })
}

fn top_n_excluding(scores: &Array1<f32>, exclude: usize, n: usize) -> Vec<usize> {
    let mut candidates: Vec<(f32, usize)> = scores
        .iter()
        .enumerate()
        .filter(|&(idx, _)| idx != exclude)
        .map(|(idx, &score)| (score, idx))
        .collect();

    candidates.sort_unstable_by(|a, b| {
        b.0
            .partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    candidates.truncate(n);

    candidates.into_iter().map(|(_, idx)| idx).collect()
}

/// Hyperparameters for the factorization machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    factors: usize,
    regularization: f32,
    sigma: f32,
    learning_rate: f32,
    learning_schedule: LearningSchedule,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters with the given latent factor rank.
    pub fn new(factors: usize) -> Self {
        Hyperparameters {
            factors,
            regularization: 0.01,
            sigma: 0.1,
            learning_rate: 0.1,
            learning_schedule: LearningSchedule::Constant,
            rng: XorShiftRng::from_seed(thread_rng().gen()),
        }
    }

    /// Set the L2 penalty applied to every weight the gradient touches.
    pub fn regularization(mut self, regularization: f32) -> Self {
        self.regularization = regularization;
        self
    }

    /// Set the standard deviation used to initialize the latent factors.
    pub fn sigma(mut self, sigma: f32) -> Self {
        self.sigma = sigma;
        self
    }

    /// Set the initial learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the learning rate schedule.
    pub fn learning_schedule(mut self, learning_schedule: LearningSchedule) -> Self {
        self.learning_schedule = learning_schedule;
        self
    }

    /// Set the random number generator.
    pub fn rng(mut self, rng: XorShiftRng) -> Self {
        self.rng = rng;
        self
    }

    /// Set the random number generator from seed.
    pub fn from_seed(mut self, seed: [u8; 16]) -> Self {
        self.rng = XorShiftRng::from_seed(seed);
        self
    }

    /// Set hyperparameters randomly: useful for hyperparameter search.
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Hyperparameters {
            factors: 2_usize.pow(Uniform::new(2, 6).sample(rng)),
            regularization: (10.0_f32).powf(Uniform::new(-6.0, -1.0).sample(rng)),
            sigma: 0.1,
            learning_rate: (10.0_f32).powf(Uniform::new(-3.0, 0.0).sample(rng)),
            learning_schedule: if Uniform::new(0.0, 1.0).sample(rng) < 0.5 {
                LearningSchedule::Constant
            } else {
                LearningSchedule::InverseScaling(0.25)
            },
            rng: XorShiftRng::from_seed(thread_rng().gen()),
        }
    }

    /// Validate the hyperparameters and build the model.
    pub fn build(self) -> Result<ImplicitFactorizationMachine, ConfigurationError> {
        if self.factors < 1 {
            return Err(ConfigurationError::InvalidFactors);
        }
        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return Err(ConfigurationError::InvalidRegularization);
        }
        if !self.sigma.is_finite() || !(self.sigma > 0.0) {
            return Err(ConfigurationError::InvalidSigma);
        }
        if !self.learning_rate.is_finite() || !(self.learning_rate > 0.0) {
            return Err(ConfigurationError::InvalidLearningRate);
        }
        if let LearningSchedule::InverseScaling(exponent) = self.learning_schedule {
            if !exponent.is_finite() || !(exponent > 0.0) {
                return Err(ConfigurationError::InvalidLearningExponent);
            }
        }

        Ok(ImplicitFactorizationMachine {
            hyper: self,
            model: None,
        })
    }
}

/// All learned weights, together with the feature matrices and observed
/// sets they were fit against. Shapes are fixed when the struct is built
/// and only a fresh (non-partial) fit replaces it wholesale.
#[derive(Clone, Debug)]
struct ModelData {
    num_users: usize,
    num_items: usize,
    interactions: Vec<Interaction>,
    observed: CompressedInteractions,
    user_features: Array2<f32>,
    item_features: Array2<f32>,
    item_biases: Array1<f32>,
    item_feature_biases: Array1<f32>,
    user_factors: Array2<f32>,
    item_factors: Array2<f32>,
    user_feature_factors: Array2<f32>,
    item_feature_factors: Array2<f32>,
}

impl ModelData {
    fn new(
        interactions: &Interactions,
        user_features: Option<&Array2<f32>>,
        item_features: Option<&Array2<f32>>,
        hyper: &mut Hyperparameters,
    ) -> Result<Self, FittingError> {
        let (num_users, num_items) = interactions.shape();

        for interaction in interactions.data() {
            if interaction.user_id() >= num_users || interaction.item_id() >= num_items {
                return Err(FittingError::IndexOutOfBounds);
            }
        }

        // A single constant column keeps shape handling uniform when no
        // side features are supplied.
        let user_feature_matrix = match user_features {
            Some(features) => {
                if features.nrows() != num_users {
                    return Err(FittingError::FeatureShapeMismatch);
                }
                features.to_owned()
            }
            None => Array2::zeros((num_users, 1)),
        };
        let item_feature_matrix = match item_features {
            Some(features) => {
                if features.nrows() != num_items {
                    return Err(FittingError::FeatureShapeMismatch);
                }
                features.to_owned()
            }
            None => Array2::zeros((num_items, 1)),
        };

        let factors = hyper.factors;
        let sigma = hyper.sigma;

        Ok(ModelData {
            num_users,
            num_items,
            interactions: interactions.data().to_owned(),
            observed: interactions.to_compressed(),
            item_biases: Array1::zeros(num_items),
            item_feature_biases: Array1::zeros(item_feature_matrix.ncols()),
            user_factors: factor_init(num_users, factors, sigma, &mut hyper.rng),
            item_factors: factor_init(num_items, factors, sigma, &mut hyper.rng),
            // Feature factors stay at zero for defaulted feature tables so
            // that the constant column cannot influence scores.
            user_feature_factors: if user_features.is_some() {
                factor_init(user_feature_matrix.ncols(), factors, sigma, &mut hyper.rng)
            } else {
                Array2::zeros((user_feature_matrix.ncols(), factors))
            },
            item_feature_factors: if item_features.is_some() {
                factor_init(item_feature_matrix.ncols(), factors, sigma, &mut hyper.rng)
            } else {
                Array2::zeros((item_feature_matrix.ncols(), factors))
            },
            user_features: user_feature_matrix,
            item_features: item_feature_matrix,
        })
    }

    /// Replace the interaction and feature inputs while keeping the
    /// learned weights, validating everything before mutating anything.
    fn update_inputs(
        &mut self,
        interactions: &Interactions,
        user_features: Option<&Array2<f32>>,
        item_features: Option<&Array2<f32>>,
    ) -> Result<(), FittingError> {
        for interaction in interactions.data() {
            if interaction.user_id() >= self.num_users || interaction.item_id() >= self.num_items {
                return Err(FittingError::IndexOutOfBounds);
            }
        }
        if let Some(features) = user_features {
            if features.dim() != self.user_features.dim() {
                return Err(FittingError::FeatureShapeMismatch);
            }
        }
        if let Some(features) = item_features {
            if features.dim() != self.item_features.dim() {
                return Err(FittingError::FeatureShapeMismatch);
            }
        }

        if let Some(features) = user_features {
            self.user_features = features.to_owned();
        }
        if let Some(features) = item_features {
            self.item_features = features.to_owned();
        }

        // The observed sets must be sized to the model's own index bounds,
        // which may be wider than the bounds of the new batch.
        let mut bounded = Interactions::new(self.num_users, self.num_items);
        for interaction in interactions.data() {
            bounded.push(interaction.clone());
        }
        self.observed = bounded.to_compressed();
        self.interactions = interactions.data().to_owned();

        Ok(())
    }

    /// The user's latent representation: their own factors plus the
    /// feature factors weighted by their feature values.
    fn latent_user(&self, user_id: UserId) -> Array1<f32> {
        self.user_feature_factors
            .t()
            .dot(&self.user_features.row(user_id)) + &self.user_factors.row(user_id)
    }

    fn latent_item(&self, item_id: ItemId) -> Array1<f32> {
        self.item_feature_factors
            .t()
            .dot(&self.item_features.row(item_id)) + &self.item_factors.row(item_id)
    }

    /// Pointwise model score for a (user, item) pair within the index
    /// bounds. Pure: repeated calls with unchanged weights return
    /// bit-identical results.
    fn score(&self, user_id: UserId, item_id: ItemId) -> f32 {
        self.item_biases[item_id]
            + self.item_features.row(item_id).dot(&self.item_feature_biases)
            + self.latent_user(user_id).dot(&self.latent_item(item_id))
    }

    /// Latent representations of every item in the catalog, one row per
    /// item.
    fn item_representations(&self) -> Array2<f32> {
        self.item_features.dot(&self.item_feature_factors) + &self.item_factors
    }

    fn user_representations(&self) -> Array2<f32> {
        self.user_features.dot(&self.user_feature_factors) + &self.user_factors
    }

    /// The feature-independent part of every item's score.
    fn item_linear_terms(&self) -> Array1<f32> {
        self.item_features.dot(&self.item_feature_biases) + &self.item_biases
    }

    /// Draw an item the user has not interacted with, by rejection
    /// sampling from the uniform distribution over the catalog. The
    /// number of attempts is capped at `MAX_SAMPLING_ATTEMPTS`; past the
    /// cap the last draw is returned even if it is an observed item.
    fn sample_negative<R: Rng>(
        &self,
        user_id: UserId,
        item_range: &Uniform<ItemId>,
        rng: &mut R,
    ) -> ItemId {
        let observed = self.observed.get_user(user_id).unwrap_or(&[]);

        let mut candidate = item_range.sample(rng);
        let mut attempts = 0;

        while observed.binary_search(&candidate).is_ok() && attempts < MAX_SAMPLING_ATTEMPTS {
            candidate = item_range.sample(rng);
            attempts += 1;
        }

        candidate
    }

    /// Apply one pairwise SGD step for an (observed, sampled-negative)
    /// item pair, returning the pre-update score margin.
    fn sgd_step(
        &mut self,
        user_id: UserId,
        positive_id: ItemId,
        negative_id: ItemId,
        learning_rate: f32,
        regularization: f32,
    ) -> f32 {
        let latent_user = self.latent_user(user_id);
        let latent_positive = self.latent_item(positive_id);
        let latent_negative = self.latent_item(negative_id);

        let positive_score = self.item_biases[positive_id]
            + self.item_features
                .row(positive_id)
                .dot(&self.item_feature_biases)
            + latent_user.dot(&latent_positive);
        let negative_score = self.item_biases[negative_id]
            + self.item_features
                .row(negative_id)
                .dot(&self.item_feature_biases)
            + latent_user.dot(&latent_negative);

        let margin = positive_score - negative_score;

        // Probability mass still to be corrected; scales every gradient
        // term below.
        let gradient = sigmoid(-margin);
        let lr = learning_rate;
        let reg = regularization;

        // Item biases move in opposite directions for the positive and
        // the negative item.
        let bias = self.item_biases[positive_id];
        self.item_biases[positive_id] -= lr * (-gradient + 2.0 * reg * bias);
        let bias = self.item_biases[negative_id];
        self.item_biases[negative_id] -= lr * (gradient + 2.0 * reg * bias);

        // Item-feature biases, weighted by each item's feature values.
        for feature in 0..self.item_features.ncols() {
            let delta = self.item_features[[negative_id, feature]]
                - self.item_features[[positive_id, feature]];
            let weight = self.item_feature_biases[feature];
            self.item_feature_biases[feature] -= lr * (gradient * delta + 2.0 * reg * weight);
        }

        // User factors are pulled towards the positive item representation
        // and away from the negative one.
        for (weight, &positive, &negative) in izip!(
            self.user_factors.row_mut(user_id).iter_mut(),
            latent_positive.iter(),
            latent_negative.iter()
        ) {
            *weight -= lr * (gradient * (negative - positive) + 2.0 * reg * *weight);
        }

        for (weight, &user) in self.item_factors
            .row_mut(positive_id)
            .iter_mut()
            .zip(latent_user.iter())
        {
            *weight -= lr * (-gradient * user + 2.0 * reg * *weight);
        }
        for (weight, &user) in self.item_factors
            .row_mut(negative_id)
            .iter_mut()
            .zip(latent_user.iter())
        {
            *weight -= lr * (gradient * user + 2.0 * reg * *weight);
        }

        // Feature factors share the user- and item-side gradients, scaled
        // by the corresponding feature values.
        for feature in 0..self.user_features.ncols() {
            let value = self.user_features[[user_id, feature]];

            for (weight, &positive, &negative) in izip!(
                self.user_feature_factors.row_mut(feature).iter_mut(),
                latent_positive.iter(),
                latent_negative.iter()
            ) {
                *weight -= lr * (gradient * value * (negative - positive) + 2.0 * reg * *weight);
            }
        }
        for feature in 0..self.item_features.ncols() {
            let positive_value = self.item_features[[positive_id, feature]];
            let negative_value = self.item_features[[negative_id, feature]];

            for (weight, &user) in self.item_feature_factors
                .row_mut(feature)
                .iter_mut()
                .zip(latent_user.iter())
            {
                *weight -=
                    lr * (gradient * (negative_value - positive_value) * user + 2.0 * reg * *weight);
            }
        }

        margin
    }
}

/// A factorization machine for implicit feedback ranking, with optional
/// user and item side features.
#[derive(Clone, Debug)]
pub struct ImplicitFactorizationMachine {
    hyper: Hyperparameters,
    model: Option<ModelData>,
}

impl ImplicitFactorizationMachine {
    /// Whether at least one fit call has completed.
    pub fn is_fit(&self) -> bool {
        self.model.is_some()
    }

    /// The number of users the model has been fit on, if fit.
    pub fn num_users(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.num_users)
    }

    /// The number of items the model has been fit on, if fit.
    pub fn num_items(&self) -> Option<usize> {
        self.model.as_ref().map(|model| model.num_items)
    }

    /// Discard any previous model state and learn new weights from
    /// scratch, running `epochs` full passes over the interactions.
    ///
    /// Returns the log-likelihood of the final epoch. With `verbose` set,
    /// each epoch's log-likelihood is also emitted as a log record.
    pub fn fit(
        &mut self,
        interactions: &Interactions,
        user_features: Option<&Array2<f32>>,
        item_features: Option<&Array2<f32>>,
        epochs: usize,
        verbose: bool,
    ) -> Result<f32, FittingError> {
        self.model = None;
        self.fit_partial(interactions, user_features, item_features, epochs, verbose)
    }

    /// Learn or update model weights resuming from the current state: the
    /// existing weights are kept and training continues on the supplied
    /// interactions, which must fall within the fitted index bounds.
    pub fn fit_partial(
        &mut self,
        interactions: &Interactions,
        user_features: Option<&Array2<f32>>,
        item_features: Option<&Array2<f32>>,
        epochs: usize,
        verbose: bool,
    ) -> Result<f32, FittingError> {
        self.fit_partial_with(
            interactions,
            user_features,
            item_features,
            epochs,
            |epoch, log_likelihood| {
                if verbose {
                    info!("epoch {}: log-likelihood {:.4}", epoch, log_likelihood);
                }
            },
        )
    }

    /// Like [`fit_partial`], but invoking `observer` once per completed
    /// epoch with the epoch number and its log-likelihood. The
    /// log-likelihood is a diagnostic computed from the same margins the
    /// gradients use; it does not feed back into the optimization.
    ///
    /// [`fit_partial`]: #method.fit_partial
    pub fn fit_partial_with<F>(
        &mut self,
        interactions: &Interactions,
        user_features: Option<&Array2<f32>>,
        item_features: Option<&Array2<f32>>,
        epochs: usize,
        mut observer: F,
    ) -> Result<f32, FittingError>
    where
        F: FnMut(usize, f32),
    {
        if interactions.is_empty() {
            return Err(FittingError::NoInteractions);
        }

        match self.model {
            Some(ref mut data) => data.update_inputs(interactions, user_features, item_features)?,
            None => {
                self.model = Some(ModelData::new(
                    interactions,
                    user_features,
                    item_features,
                    &mut self.hyper,
                )?)
            }
        }

        let hyper = &mut self.hyper;
        let mut last_log_likelihood = 0.0;

        if let Some(ref mut data) = self.model {
            let item_range = Uniform::new(0, data.num_items);
            let mut pairs: Vec<(UserId, ItemId)> = data.interactions
                .iter()
                .map(|x| (x.user_id(), x.item_id()))
                .collect();

            for epoch in 0..epochs {
                // Shuffling is irrelevant to correctness but required for
                // SGD convergence quality.
                pairs.shuffle(&mut hyper.rng);

                let learning_rate = hyper
                    .learning_schedule
                    .effective_rate(hyper.learning_rate, epoch);
                let mut log_likelihood = 0.0;

                for &(user_id, positive_id) in &pairs {
                    let negative_id =
                        data.sample_negative(user_id, &item_range, &mut hyper.rng);
                    let margin = data.sgd_step(
                        user_id,
                        positive_id,
                        negative_id,
                        learning_rate,
                        hyper.regularization,
                    );

                    log_likelihood += log_sigmoid(margin);
                }

                observer(epoch, log_likelihood);
                last_log_likelihood = log_likelihood;
            }
        }

        Ok(last_log_likelihood)
    }

    /// Calculate the pointwise utility of every (user, item) pair.
    ///
    /// Pairs outside the fitted index bounds score as NaN under
    /// [`ColdStart::Nan`] and are removed from the output under
    /// [`ColdStart::Drop`]; they never fail the call.
    ///
    /// [`ColdStart::Nan`]: ../enum.ColdStart.html
    /// [`ColdStart::Drop`]: ../enum.ColdStart.html
    pub fn predict(
        &self,
        pairs: &[(UserId, ItemId)],
        cold_start: ColdStart,
    ) -> Result<Vec<f32>, PredictionError> {
        let data = self.model.as_ref().ok_or(PredictionError::ModelNotFit)?;

        let scores: Vec<f32> = pairs
            .par_iter()
            .map(|&(user_id, item_id)| {
                if user_id >= data.num_users || item_id >= data.num_items {
                    f32::NAN
                } else {
                    data.score(user_id, item_id)
                }
            })
            .collect();

        Ok(match cold_start {
            ColdStart::Nan => scores,
            ColdStart::Drop => scores.into_iter().filter(|x| !x.is_nan()).collect(),
        })
    }

    /// Calculate up to `n_items` top-ranked items for each user.
    ///
    /// Items are ordered by descending score, ties broken by ascending
    /// item index for reproducibility. With `filter_previous` set, items
    /// from the user's observed set are excluded before ranking. Users
    /// outside the fitted index get a row of `None` markers under
    /// [`ColdStart::Nan`] and no row at all under [`ColdStart::Drop`].
    ///
    /// [`ColdStart::Nan`]: ../enum.ColdStart.html
    /// [`ColdStart::Drop`]: ../enum.ColdStart.html
    pub fn recommend(
        &self,
        users: &[UserId],
        n_items: usize,
        filter_previous: bool,
        cold_start: ColdStart,
    ) -> Result<Vec<(UserId, Vec<Option<ItemId>>)>, PredictionError> {
        let data = self.model.as_ref().ok_or(PredictionError::ModelNotFit)?;

        let item_linear_terms = data.item_linear_terms();
        let item_representations = data.item_representations();

        let recommendations = users
            .par_iter()
            .filter_map(|&user_id| {
                if user_id >= data.num_users {
                    return match cold_start {
                        ColdStart::Nan => Some((user_id, vec![None; n_items])),
                        ColdStart::Drop => None,
                    };
                }

                let scores =
                    item_representations.dot(&data.latent_user(user_id)) + &item_linear_terms;
                let observed = data.observed.get_user(user_id).unwrap_or(&[]);

                let mut candidates: Vec<(f32, ItemId)> = scores
                    .iter()
                    .enumerate()
                    .filter(|&(item_id, _)| {
                        !(filter_previous && observed.binary_search(&item_id).is_ok())
                    })
                    .map(|(item_id, &score)| (score, item_id))
                    .collect();

                candidates.sort_unstable_by(|a, b| {
                    b.0
                        .partial_cmp(&a.0)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.1.cmp(&b.1))
                });
                candidates.truncate(n_items);

                Some((
                    user_id,
                    candidates
                        .into_iter()
                        .map(|(_, item_id)| Some(item_id))
                        .collect(),
                ))
            })
            .collect();

        Ok(recommendations)
    }

    /// Find the `n_items` most similar items by dot product in latent
    /// representation space, excluding the query item itself.
    pub fn similar_items(
        &self,
        item_id: ItemId,
        n_items: usize,
    ) -> Result<Vec<ItemId>, PredictionError> {
        let data = self.model.as_ref().ok_or(PredictionError::ModelNotFit)?;

        if item_id >= data.num_items {
            return Err(PredictionError::UnknownId);
        }

        let representations = data.item_representations();
        let query = representations.row(item_id).to_owned();
        let similarities = representations.dot(&query);

        Ok(top_n_excluding(&similarities, item_id, n_items))
    }

    /// Find the `n_users` most similar users by dot product in latent
    /// representation space, excluding the query user itself.
    pub fn similar_users(
        &self,
        user_id: UserId,
        n_users: usize,
    ) -> Result<Vec<UserId>, PredictionError> {
        let data = self.model.as_ref().ok_or(PredictionError::ModelNotFit)?;

        if user_id >= data.num_users {
            return Err(PredictionError::UnknownId);
        }

        let representations = data.user_representations();
        let query = representations.row(user_id).to_owned();
        let similarities = representations.dot(&query);

        Ok(top_n_excluding(&similarities, user_id, n_users))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 3 users, 4 items, user 0 observed items 0 and 1.
    fn toy_interactions() -> Interactions {
        Interactions::from(vec![
            Interaction::new(0, 0),
            Interaction::new(0, 1),
            Interaction::new(1, 2),
            Interaction::new(2, 3),
        ])
    }

    fn model() -> ImplicitFactorizationMachine {
        Hyperparameters::new(2)
            .learning_rate(0.1)
            .rng(XorShiftRng::from_seed([42; 16]))
            .build()
            .unwrap()
    }

    fn fitted(epochs: usize) -> ImplicitFactorizationMachine {
        let mut model = model();
        model
            .fit(&toy_interactions(), None, None, epochs, false)
            .unwrap();
        model
    }

    fn all_pairs(num_users: usize, num_items: usize) -> Vec<(UserId, ItemId)> {
        iproduct!(0..num_users, 0..num_items).collect()
    }

    #[test]
    fn scoring_is_deterministic() {
        let model = fitted(5);
        let pairs = all_pairs(3, 4);

        let first = model.predict(&pairs, ColdStart::Nan).unwrap();
        let second = model.predict(&pairs, ColdStart::Nan).unwrap();

        assert_eq!(first.len(), pairs.len());
        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn unknown_pairs_score_nan() {
        let model = fitted(5);

        let scores = model
            .predict(&[(0, 99), (99, 0), (0, 0)], ColdStart::Nan)
            .unwrap();

        assert!(scores[0].is_nan());
        assert!(scores[1].is_nan());
        assert!(scores[2].is_finite());
    }

    #[test]
    fn cold_start_drop_removes_only_nans() {
        let model = fitted(5);
        let pairs = vec![(0, 0), (0, 99), (1, 2), (99, 1), (2, 3)];

        let with_nans = model.predict(&pairs, ColdStart::Nan).unwrap();
        let dropped = model.predict(&pairs, ColdStart::Drop).unwrap();

        let retained: Vec<f32> = with_nans.into_iter().filter(|x| !x.is_nan()).collect();

        assert_eq!(dropped.len(), retained.len());
        for (x, y) in dropped.iter().zip(retained.iter()) {
            assert!(!x.is_nan());
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn negative_sampler_avoids_observed_items() {
        let mut model = model();
        let mut interactions = Interactions::new(2, 50);
        interactions.push(Interaction::new(0, 0));
        interactions.push(Interaction::new(0, 1));
        interactions.push(Interaction::new(1, 49));
        model.fit(&interactions, None, None, 0, false).unwrap();

        let data = model.model.as_ref().unwrap();
        let item_range = Uniform::new(0, data.num_items);
        let mut rng = XorShiftRng::from_seed([7; 16]);

        for _ in 0..1000 {
            let negative = data.sample_negative(0, &item_range, &mut rng);
            assert!(negative != 0 && negative != 1);
            assert!(negative < 50);
        }
    }

    #[test]
    fn sampler_cap_terminates_on_full_catalog_user() {
        let mut model = model();
        let interactions = Interactions::from(vec![
            Interaction::new(0, 0),
            Interaction::new(0, 1),
            Interaction::new(0, 2),
        ]);
        model.fit(&interactions, None, None, 0, false).unwrap();

        let data = model.model.as_ref().unwrap();
        let item_range = Uniform::new(0, data.num_items);
        let mut rng = XorShiftRng::from_seed([7; 16]);

        // Every item is observed, so only the attempt cap stops the loop.
        let negative = data.sample_negative(0, &item_range, &mut rng);
        assert!(negative < 3);
    }

    #[test]
    fn single_gradient_step_improves_margin() {
        let mut model = fitted(0);
        let data = model.model.as_mut().unwrap();

        let before = data.score(0, 0) - data.score(0, 3);
        data.sgd_step(0, 0, 3, 0.01, 0.0);
        let after = data.score(0, 0) - data.score(0, 3);

        assert!(after > before);
    }

    #[test]
    fn training_improves_log_likelihood() {
        let mut interactions = Interactions::new(10, 20);
        for user_id in 0..10 {
            interactions.push(Interaction::new(user_id, user_id));
            interactions.push(Interaction::new(user_id, user_id + 10));
        }

        let mut model = model();
        let mut log_likelihoods = Vec::new();
        let mut epochs_seen = Vec::new();

        model
            .fit_partial_with(&interactions, None, None, 30, |epoch, log_likelihood| {
                epochs_seen.push(epoch);
                log_likelihoods.push(log_likelihood);
            })
            .unwrap();

        assert_eq!(epochs_seen, (0..30).collect::<Vec<_>>());
        assert!(log_likelihoods.iter().all(|x| x.is_finite()));

        let first: f32 = log_likelihoods[..5].iter().sum();
        let last: f32 = log_likelihoods[25..].iter().sum();
        assert!(last > first);
    }

    #[test]
    fn recommendations_are_sorted_and_unique() {
        let model = fitted(5);

        let recommendations = model
            .recommend(&[0, 1, 2], 4, false, ColdStart::Nan)
            .unwrap();

        assert_eq!(recommendations.len(), 3);

        for (user_id, row) in recommendations {
            let items: Vec<ItemId> = row.into_iter().map(|x| x.unwrap()).collect();

            let mut deduplicated = items.clone();
            deduplicated.sort_unstable();
            deduplicated.dedup();
            assert_eq!(deduplicated.len(), items.len());

            let pairs: Vec<(UserId, ItemId)> =
                items.iter().map(|&item_id| (user_id, item_id)).collect();
            let scores = model.predict(&pairs, ColdStart::Nan).unwrap();
            for window in scores.windows(2) {
                assert!(window[0] >= window[1]);
            }
        }
    }

    #[test]
    fn end_to_end_filtering_excludes_observed_items() {
        let model = fitted(5);

        // Every (user, item) pair scores without error.
        let scores = model.predict(&all_pairs(3, 4), ColdStart::Nan).unwrap();
        assert_eq!(scores.len(), 12);
        assert!(scores.iter().all(|x| x.is_finite()));

        let recommendations = model.recommend(&[0], 2, true, ColdStart::Nan).unwrap();
        let (user_id, row) = &recommendations[0];

        assert_eq!(*user_id, 0);
        for item in row {
            let item = item.unwrap();
            assert!(item != 0 && item != 1);
        }
    }

    #[test]
    fn cold_start_users_in_recommendations() {
        let model = fitted(5);

        let with_markers = model.recommend(&[0, 99], 2, false, ColdStart::Nan).unwrap();
        assert_eq!(with_markers.len(), 2);
        assert_eq!(with_markers[1], (99, vec![None, None]));

        let dropped = model.recommend(&[0, 99], 2, false, ColdStart::Drop).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].0, 0);
    }

    #[test]
    fn configuration_validation() {
        assert!(matches!(
            Hyperparameters::new(0).build(),
            Err(ConfigurationError::InvalidFactors)
        ));
        assert!(matches!(
            Hyperparameters::new(2).regularization(-1.0).build(),
            Err(ConfigurationError::InvalidRegularization)
        ));
        assert!(matches!(
            Hyperparameters::new(2).sigma(0.0).build(),
            Err(ConfigurationError::InvalidSigma)
        ));
        assert!(matches!(
            Hyperparameters::new(2).learning_rate(0.0).build(),
            Err(ConfigurationError::InvalidLearningRate)
        ));
        assert!(matches!(
            Hyperparameters::new(2)
                .learning_schedule(LearningSchedule::InverseScaling(0.0))
                .build(),
            Err(ConfigurationError::InvalidLearningExponent)
        ));
        assert!(Hyperparameters::new(2).build().is_ok());
    }

    #[test]
    fn schema_mismatch_leaves_weights_unchanged() {
        let mut model = fitted(5);

        let (item_biases, user_factors) = {
            let data = model.model.as_ref().unwrap();
            (data.item_biases.clone(), data.user_factors.clone())
        };

        let bad_features = Array2::<f32>::zeros((99, 1));
        let result =
            model.fit_partial(&toy_interactions(), Some(&bad_features), None, 1, false);

        assert!(matches!(result, Err(FittingError::FeatureShapeMismatch)));

        let data = model.model.as_ref().unwrap();
        assert_eq!(data.item_biases, item_biases);
        assert_eq!(data.user_factors, user_factors);
    }

    #[test]
    fn partial_fit_resumes_from_existing_weights() {
        let mut model = fitted(1);

        let item_biases = model.model.as_ref().unwrap().item_biases.clone();
        model
            .fit_partial(&toy_interactions(), None, None, 1, false)
            .unwrap();

        let data = model.model.as_ref().unwrap();
        assert_eq!(data.user_factors.dim(), (3, 2));
        assert_ne!(data.item_biases, item_biases);
    }

    #[test]
    fn fresh_fit_reinitializes_shapes() {
        let mut model = fitted(1);
        assert_eq!(model.num_items(), Some(4));

        let bigger = Interactions::from(vec![
            Interaction::new(0, 4),
            Interaction::new(3, 0),
        ]);
        model.fit(&bigger, None, None, 1, false).unwrap();

        assert_eq!(model.num_users(), Some(4));
        assert_eq!(model.num_items(), Some(5));
    }

    #[test]
    fn fitting_with_side_features() {
        let user_features = Array2::from_shape_vec(
            (3, 2),
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        ).unwrap();
        let item_features = Array2::from_shape_vec(
            (4, 3),
            vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0],
        ).unwrap();

        let mut model = model();
        model
            .fit(
                &toy_interactions(),
                Some(&user_features),
                Some(&item_features),
                5,
                false,
            )
            .unwrap();

        let scores = model.predict(&all_pairs(3, 4), ColdStart::Nan).unwrap();
        assert!(scores.iter().all(|x| x.is_finite()));

        let recommendations = model.recommend(&[0, 1, 2], 4, false, ColdStart::Nan).unwrap();
        assert_eq!(recommendations.len(), 3);
    }

    #[test]
    fn empty_interactions_are_rejected() {
        let mut model = model();
        let result = model.fit(&Interactions::new(0, 0), None, None, 1, false);

        assert!(matches!(result, Err(FittingError::NoInteractions)));
        assert!(!model.is_fit());
    }

    #[test]
    fn out_of_bounds_interactions_are_rejected() {
        let mut model = model();
        let mut interactions = Interactions::new(2, 2);
        interactions.push(Interaction::new(5, 1));

        let result = model.fit(&interactions, None, None, 1, false);

        assert!(matches!(result, Err(FittingError::IndexOutOfBounds)));
        assert!(!model.is_fit());
    }

    #[test]
    fn prediction_before_fitting_errors() {
        let model = model();

        assert!(matches!(
            model.predict(&[(0, 0)], ColdStart::Nan),
            Err(PredictionError::ModelNotFit)
        ));
        assert!(matches!(
            model.recommend(&[0], 2, false, ColdStart::Nan),
            Err(PredictionError::ModelNotFit)
        ));
    }

    #[test]
    fn similar_items_excludes_the_query() {
        let model = fitted(5);

        let similar = model.similar_items(0, 2).unwrap();
        assert!(similar.len() <= 2);
        assert!(!similar.contains(&0));

        assert!(matches!(
            model.similar_items(99, 2),
            Err(PredictionError::UnknownId)
        ));

        let similar_users = model.similar_users(0, 2).unwrap();
        assert!(!similar_users.contains(&0));
    }
}
