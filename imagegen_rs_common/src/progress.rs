use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// A progress bar which is hidden when `silent` is set.
///
/// `COLOR` is one of `'b'` (blue), `'g'` (green) or `'r'` (red).
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'>(
    pub T,
    pub &'static str,
    pub bool,
);

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let color = match COLOR {
            'g' => "green",
            'r' => "red",
            _ => "blue",
        };
        let bar = if self.2 {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(self.0.len() as u64)
        };
        if let Ok(style) = ProgressStyle::default_bar().template(&format!(
            "{}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})",
            self.1
        )) {
            bar.set_style(style.progress_chars("#>-"));
        }
        self.0.progress_with(bar)
    }
}

/// Wrap an iterator in a (possibly hidden) progress bar.
pub trait IterWithProgress<'a, T>: Iterator<Item = T> + 'a {
    fn with_progress(self, is_silent: bool) -> Box<dyn Iterator<Item = T> + 'a>
    where
        Self: Sized + ExactSizeIterator,
    {
        Box::new(NiceProgressBar::<_, 'b'>(self, "Loading tensors", is_silent).into_iter())
    }
}

impl<'a, T: Iterator<Item = I> + 'a, I> IterWithProgress<'a, I> for T {}
