//! Model evaluation utilities.

use rayon::prelude::*;

use data::CompressedInteractions;
use models::fm::ImplicitFactorizationMachine;
use models::ColdStart;
use {ItemId, PredictionError, UserId};

/// Compute the mean reciprocal rank of each test user's last held-out item
/// over the full catalog, masking the user's remaining test items.
///
/// Users with fewer than two test interactions, and users or items outside
/// the fitted index, are skipped.
pub fn mrr_score(
    model: &ImplicitFactorizationMachine,
    test: &CompressedInteractions,
) -> Result<f32, PredictionError> {
    if !model.is_fit() {
        return Err(PredictionError::ModelNotFit);
    }

    let mrrs: Vec<f32> = test.iter_users()
        .collect::<Vec<_>>()
        .par_iter()
        .filter_map(|test_user| {
            if test_user.item_ids.len() < 2 {
                return None;
            }

            let masked_items = &test_user.item_ids[..test_user.item_ids.len() - 1];
            let test_item = test_user.item_ids[test_user.item_ids.len() - 1];

            let pairs: Vec<(UserId, ItemId)> = (0..test.num_items())
                .map(|item_id| (test_user.user_id, item_id))
                .collect();
            let mut predictions = model.predict(&pairs, ColdStart::Nan).ok()?;

            if predictions.iter().any(|x| x.is_nan()) {
                return None;
            }

            for &masked_item in masked_items {
                predictions[masked_item] = f32::MIN;
            }

            let test_score = predictions[test_item];
            let rank = predictions.iter().filter(|&&x| x >= test_score).count();

            Some(1.0 / rank as f32)
        })
        .collect();

    Ok(mrrs.iter().sum::<f32>() / mrrs.len() as f32)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use data::{Interaction, Interactions};
    use models::fm::Hyperparameters;

    #[test]
    fn mrr_is_a_valid_reciprocal_rank() {
        let interactions = Interactions::from(vec![
            Interaction::new(0, 0),
            Interaction::new(0, 1),
            Interaction::new(1, 1),
            Interaction::new(1, 2),
            Interaction::new(2, 2),
            Interaction::new(2, 3),
        ]);

        let mut model = Hyperparameters::new(2)
            .rng(XorShiftRng::from_seed([42; 16]))
            .build()
            .unwrap();
        model.fit(&interactions, None, None, 5, false).unwrap();

        let mrr = mrr_score(&model, &interactions.to_compressed()).unwrap();

        assert!(mrr > 0.0 && mrr <= 1.0);
    }

    #[test]
    fn mrr_requires_a_fitted_model() {
        let model = Hyperparameters::new(2).build().unwrap();
        let test = Interactions::from(vec![Interaction::new(0, 0)]).to_compressed();

        assert!(mrr_score(&model, &test).is_err());
    }
}
