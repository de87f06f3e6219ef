use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Builds a mono cubic resampler taking `chunk_size` input frames per call.
pub fn create_resampler(
    in_rate: f64,
    out_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    Ok(FastFixedIn::<f32>::new(
        out_rate / in_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?)
}

/// Resamples an unbounded mono stream delivered in arbitrary block sizes.
///
/// Filter state carries across pushes, so block boundaries leave no seams.
/// Input that does not fill a whole resampler chunk is held until the next push.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, chunk_size)?)
        };
        Ok(Self {
            inner,
            pending: Vec::with_capacity(chunk_size * 2),
        })
    }

    pub fn push(&mut self, samples: &[f32]) -> anyhow::Result<Vec<f32>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let mut chunk = resampler.process(&[&self.pending[..needed]], None)?;
            self.pending.drain(..needed);
            if let Some(channel) = chunk.pop() {
                output.extend(channel);
            }
        }
        Ok(output)
    }
}
