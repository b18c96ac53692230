use candle_core::{Result, Tensor, Var};

/// Latent input for one generator forward pass.
///
/// `Mixed` routes `primary` to the synthesis blocks before `crossover` and
/// `secondary` to the remaining ones.
#[derive(Debug, Clone)]
pub enum LatentInput {
    Single(Tensor),
    Mixed {
        primary: Tensor,
        secondary: Tensor,
        crossover: usize,
    },
}

impl LatentInput {
    pub fn batch_size(&self) -> Result<usize> {
        let tensor = match self {
            LatentInput::Single(code) => code,
            LatentInput::Mixed { primary, .. } => primary,
        };
        Ok(tensor.dims2()?.0)
    }

    pub fn is_mixed(&self) -> bool {
        matches!(self, LatentInput::Mixed { .. })
    }
}

/// Named generator parameters split by learning-rate group.
#[derive(Debug, Clone, Default)]
pub struct ParameterGroups {
    pub synthesis: Vec<(String, Var)>,
    pub style: Vec<(String, Var)>,
}

impl ParameterGroups {
    pub fn all(&self) -> Vec<(String, Var)> {
        self.synthesis
            .iter()
            .chain(self.style.iter())
            .cloned()
            .collect()
    }
}

pub trait Generator {
    /// Renders a batch at resolution `4 * 2^step`, cross-fading the newest tier by `alpha`.
    fn forward(&self, latent: &LatentInput, step: usize, alpha: f64) -> Result<Tensor>;

    fn parameter_groups(&self) -> Result<ParameterGroups>;

    fn code_size(&self) -> usize;
}

pub trait Discriminator {
    /// Scores a batch of images rendered at tier `step`, one value per sample.
    fn forward(&self, images: &Tensor, step: usize, alpha: f64) -> Result<Tensor>;

    fn parameters(&self) -> Result<Vec<(String, Var)>>;
}
