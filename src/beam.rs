//! Beam search decoding over an arbitrary next-token scorer.

/// Decoding parameters for caption generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Number of hypotheses kept alive per step.
    pub num_beams: usize,
    /// Maximum sequence length, prompt included.
    pub max_length: usize,
    /// Forbid repeating any n-gram of this size (0 disables).
    pub no_repeat_ngram_size: usize,
    /// Exponent applied to the generated length when ranking hypotheses.
    pub length_penalty: f64,
    /// Token that terminates a hypothesis.
    pub eos_token_id: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_beams: 5,
            max_length: 40,
            no_repeat_ngram_size: 2,
            length_penalty: 1.0,
            eos_token_id: 102,
        }
    }
}

struct Hypothesis {
    tokens: Vec<u32>,
    log_prob: f64,
}

/// Runs beam search starting from `prompt`.
///
/// `next_log_probs` receives the full token sequence of a hypothesis and must
/// return log-probabilities over the vocabulary for the next token. The
/// returned tokens exclude the prompt and the end token.
pub fn beam_search<E, F>(
    prompt: &[u32],
    config: &GenerationConfig,
    mut next_log_probs: F,
) -> Result<Vec<u32>, E>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>, E>,
{
    let num_beams = config.num_beams.max(1);
    let score = |log_prob: f64, len: usize| {
        let generated = len.saturating_sub(prompt.len()).max(1) as f64;
        log_prob / generated.powf(config.length_penalty)
    };

    let mut running = vec![Hypothesis {
        tokens: prompt.to_vec(),
        log_prob: 0.0,
    }];
    let mut finished: Vec<(f64, Vec<u32>)> = Vec::new();

    while let Some(first) = running.first() {
        if first.tokens.len() >= config.max_length {
            break;
        }

        let mut candidates: Vec<(f64, usize, u32)> = Vec::new();
        for (beam_idx, hyp) in running.iter().enumerate() {
            let mut log_probs = next_log_probs(&hyp.tokens)?;
            for token in banned_tokens(&hyp.tokens, config.no_repeat_ngram_size) {
                if let Some(lp) = log_probs.get_mut(token as usize) {
                    *lp = f32::NEG_INFINITY;
                }
            }
            for (token, lp) in top_k(&log_probs, 2 * num_beams) {
                candidates.push((hyp.log_prob + lp as f64, beam_idx, token));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next = Vec::with_capacity(num_beams);
        for (rank, (log_prob, beam_idx, token)) in candidates.into_iter().enumerate() {
            let parent = &running[beam_idx].tokens;
            if token == config.eos_token_id {
                // an end token only counts when it ranks among the top beams
                if rank < num_beams {
                    // the end token itself does not count towards the length
                    finished.push((score(log_prob, parent.len()), parent.clone()));
                }
            } else {
                let mut tokens = Vec::with_capacity(parent.len() + 1);
                tokens.extend_from_slice(parent);
                tokens.push(token);
                next.push(Hypothesis { tokens, log_prob });
            }
            if next.len() == num_beams {
                break;
            }
        }
        running = next;

        if finished.len() >= num_beams {
            finished.sort_by(|a, b| b.0.total_cmp(&a.0));
            finished.truncate(num_beams);
            let worst_finished = finished[finished.len() - 1].0;
            let can_improve = running
                .first()
                .is_some_and(|h| score(h.log_prob, h.tokens.len()) > worst_finished);
            if !can_improve {
                running.clear();
            }
        }
    }

    finished.extend(
        running
            .into_iter()
            .map(|h| (score(h.log_prob, h.tokens.len()), h.tokens)),
    );

    let best = finished
        .into_iter()
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, tokens)| tokens)
        .unwrap_or_else(|| prompt.to_vec());

    Ok(best[prompt.len()..].to_vec())
}

/// Tokens that would complete an n-gram already present in `tokens`.
pub fn banned_tokens(tokens: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &tokens[tokens.len() + 1 - n..];
    tokens
        .windows(n)
        .filter(|window| &window[..n - 1] == prefix)
        .map(|window| window[n - 1])
        .collect()
}

fn top_k(log_probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut scored: Vec<(u32, f32)> = log_probs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(idx, lp)| (idx as u32, *lp))
        .collect();
    if scored.len() > k {
        scored.select_nth_unstable_by(k, |a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
    }
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    const EOS: u32 = 0;
    const VOCAB: usize = 6;

    fn config(num_beams: usize, max_length: usize, ngram: usize) -> GenerationConfig {
        GenerationConfig {
            num_beams,
            max_length,
            no_repeat_ngram_size: ngram,
            length_penalty: 1.0,
            eos_token_id: EOS,
        }
    }

    fn log_dist(probs: &[(u32, f32)]) -> Vec<f32> {
        let mut out = vec![f32::NEG_INFINITY; VOCAB];
        for (token, p) in probs {
            out[*token as usize] = p.ln();
        }
        out
    }

    #[test]
    fn test_banned_tokens_bigram() {
        assert_eq!(banned_tokens(&[1, 2, 1], 2), vec![2]);
        assert_eq!(banned_tokens(&[1, 2, 3], 2), Vec::<u32>::new());
        assert_eq!(banned_tokens(&[5], 2), Vec::<u32>::new());
    }

    #[test]
    fn test_banned_tokens_unigram_bans_everything_seen() {
        let mut banned = banned_tokens(&[3, 1, 3], 1);
        banned.sort();
        assert_eq!(banned, vec![1, 3, 3]);
    }

    #[test]
    fn test_banned_tokens_disabled() {
        assert!(banned_tokens(&[1, 1, 1], 0).is_empty());
    }

    #[test]
    fn test_top_k_orders_and_skips_masked() {
        let probs = vec![-1.0, f32::NEG_INFINITY, -0.5, -3.0];
        assert_eq!(top_k(&probs, 2), vec![(2, -0.5), (0, -1.0)]);
        assert_eq!(top_k(&probs, 10).len(), 3);
    }

    #[test]
    fn test_beam_beats_greedy() {
        // greedy takes 1 (0.6) then gets a flat tail; the 0.4 branch leads to
        // a near-certain continuation and wins overall
        let result = beam_search(&[9], &config(2, 10, 0), |tokens| {
            let dist = match tokens {
                [9] => log_dist(&[(1, 0.6), (2, 0.4)]),
                [9, 1] => log_dist(&[(3, 0.3), (4, 0.3), (5, 0.4)]),
                [9, 2] => log_dist(&[(3, 0.99), (EOS, 0.01)]),
                _ => log_dist(&[(EOS, 1.0)]),
            };
            Ok::<_, Infallible>(dist)
        })
        .unwrap();
        assert_eq!(result, vec![2, 3]);
    }

    #[test]
    fn test_respects_max_length() {
        let result = beam_search(&[9], &config(3, 6, 0), |_| {
            Ok::<_, Infallible>(log_dist(&[(1, 0.5), (2, 0.5)]))
        })
        .unwrap();
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn test_never_repeats_bigram() {
        // the scorer always prefers to alternate 1 and 2
        let result = beam_search(&[9], &config(3, 12, 2), |tokens| {
            let last = *tokens.last().unwrap();
            let dist = if last == 1 {
                log_dist(&[(2, 0.7), (3, 0.2), (4, 0.1)])
            } else {
                log_dist(&[(1, 0.7), (4, 0.2), (5, 0.1)])
            };
            Ok::<_, Infallible>(dist)
        })
        .unwrap();

        let mut full = vec![9];
        full.extend(&result);
        let mut seen = std::collections::HashSet::new();
        for pair in full.windows(2) {
            assert!(seen.insert((pair[0], pair[1])), "bigram {pair:?} repeated");
        }
    }

    #[test]
    fn test_stops_at_eos() {
        let result = beam_search(&[9], &config(2, 20, 2), |tokens| {
            let dist = if tokens.len() < 3 {
                log_dist(&[(1 + tokens.len() as u32, 0.9), (EOS, 0.1)])
            } else {
                log_dist(&[(EOS, 0.95), (5, 0.05)])
            };
            Ok::<_, Infallible>(dist)
        })
        .unwrap();
        assert_eq!(result, vec![2, 3]);
    }

    #[test]
    fn test_length_normalization_ignores_end_token() {
        // [1] ends right away with ln(0.6) over one token, [2, 3] ends with
        // ln(0.4) over two tokens and has the better average
        let result = beam_search(&[9], &config(2, 10, 0), |tokens| {
            let dist = match tokens {
                [9] => log_dist(&[(1, 0.6), (2, 0.4)]),
                [9, 2] => log_dist(&[(3, 1.0)]),
                _ => log_dist(&[(EOS, 1.0)]),
            };
            Ok::<_, Infallible>(dist)
        })
        .unwrap();
        assert_eq!(result, vec![2, 3]);
    }

    #[test]
    fn test_scorer_error_propagates() {
        let result: Result<Vec<u32>, &str> =
            beam_search(&[9], &config(2, 5, 0), |_| Err("decoder failed"));
        assert_eq!(result.unwrap_err(), "decoder failed");
    }

    #[test]
    fn test_prompt_already_at_max_length() {
        let result = beam_search(&[9, 8], &config(2, 2, 0), |_| {
            Ok::<_, Infallible>(log_dist(&[(1, 1.0)]))
        })
        .unwrap();
        assert!(result.is_empty());
    }
}
