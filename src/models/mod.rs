//! Models module.
pub mod fm;

/// Schedule for adjusting the learning rate across training epochs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum LearningSchedule {
    /// The same learning rate is used for every epoch.
    Constant,
    /// The learning rate decays as `learning_rate / (epoch + 1)^exponent`,
    /// with zero-based epochs.
    InverseScaling(f32),
}

impl LearningSchedule {
    /// Return the learning rate in effect for the given (zero-based) epoch.
    pub fn effective_rate(&self, learning_rate: f32, epoch: usize) -> f32 {
        match *self {
            LearningSchedule::Constant => learning_rate,
            LearningSchedule::InverseScaling(exponent) => {
                learning_rate / ((epoch + 1) as f32).powf(exponent)
            }
        }
    }
}

/// Policy for handling users or items absent from the fitted index.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColdStart {
    /// Emit missing-value markers for the affected entries.
    Nan,
    /// Drop the affected entries from the output.
    Drop,
}
