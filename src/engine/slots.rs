use crate::model::{Ms, Span};

/// Candidate starts of `duration` inside `spans`, stepping by `step` from each
/// span's start, that overlap nothing in `busy`.
///
/// Output follows span order and is ascending within a span. Starts are not
/// rounded; a span starting at 09:10 with a 15 minute step yields 09:10,
/// 09:25, …
pub fn enumerate(spans: &[Span], busy: &[Span], duration: Ms, step: Ms) -> Vec<Span> {
    if duration <= 0 || step <= 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for span in spans {
        // Busy intervals that can touch this span at all.
        let relevant: Vec<&Span> = busy.iter().filter(|b| b.overlaps(span)).collect();
        let mut t = span.start;
        while t + duration <= span.end {
            let candidate = Span::new(t, t + duration);
            if !relevant.iter().any(|b| b.overlaps(&candidate)) {
                out.push(candidate);
            }
            t += step;
        }
    }
    out
}
