use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;
use imagegen_rs_common::NiceProgressBar;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// Draw the initial latents from a standard normal distribution.
///
/// Noise is always drawn on the CPU so that a seed gives the same latents on every device.
pub fn initial_latents(
    shape: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let (b, c, h, w) = shape;
    let noise = (0..b * c * h * w)
        .map(|_| StandardNormal.sample(&mut rng))
        .collect::<Vec<f32>>();
    Tensor::from_vec(noise, shape, &Device::Cpu)?
        .to_device(device)?
        .to_dtype(dtype)
}

/// Classifier-free guided denoising.
pub struct Sampler {
    guidance_scale: f64,
}

impl Sampler {
    pub fn new(guidance_scale: f64) -> Self {
        Self { guidance_scale }
    }

    /// Guidance only changes the prediction for scales above 1.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.
    }

    /// Run the denoising process over the given latents.
    ///
    /// Expects a step closure predicting the noise:
    /// ```ignore
    /// fn(latent_model_input: &Tensor, timestep: usize) -> Result<Tensor>;
    /// ```
    /// With guidance, the closure receives the latents twice along the batch dimension and must
    /// return the unconditional prediction first.
    pub fn sample(
        &self,
        scheduler: &mut dyn Scheduler,
        latents: &Tensor,
        step: impl Fn(&Tensor, usize) -> Result<Tensor>,
        silent: bool,
    ) -> Result<Tensor> {
        let timesteps = scheduler.timesteps().to_vec();
        let mut latents = (latents * scheduler.init_noise_sigma())?;
        for timestep in NiceProgressBar::<_, 'g'>(timesteps.into_iter(), "Denoise loop", silent) {
            let model_input = if self.uses_guidance() {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = step(&model_input, timestep)?;

            let noise_pred = if self.uses_guidance() {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * self.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }
        Ok(latents)
    }
}
