//! Lightweight text embedding and clustering for small result sets.
//!
//! Hashing bag-of-words embeddings (256-dim), cosine similarity, a bounded
//! k-means with k-means++-style seeding, and a density fallback that groups
//! connected components above a similarity threshold. Intended for a few
//! dozen titles/abstracts, not a performance-critical path.

use rand::Rng;
use std::collections::HashMap;

pub const DIM: usize = 256;

/// Maximum k-means iterations; there is no convergence guarantee beyond this cap.
const MAX_ITERATIONS: usize = 30;

pub type Embedding = Vec<f32>;

/// Lowercase terms of 3..=31 chars, split on non-alphanumerics
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > 2 && w.len() < 32)
        .map(|w| w.to_string())
        .collect()
}

fn fnv1a(token: &str) -> u32 {
    let mut h: u32 = 2166136261;
    for b in token.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(16777619);
    }
    h
}

/// Hash title and snippet terms into a unit-norm bag-of-words vector.
/// Title terms carry twice the weight of snippet terms.
pub fn embed_text(title: &str, snippet: &str) -> Embedding {
    let mut v = vec![0.0f32; DIM];
    for tok in tokenize(title) {
        v[(fnv1a(&tok) as usize) % DIM] += 2.0;
    }
    for tok in tokenize(snippet) {
        v[(fnv1a(&tok) as usize) % DIM] += 1.0;
    }
    l2_norm(&v)
}

pub fn l2_norm(v: &[f32]) -> Embedding {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm = if norm == 0.0 { 1.0 } else { norm };
    v.iter().map(|x| x / norm).collect()
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let s: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    s.clamp(-1.0, 1.0)
}

fn mean_vec(vs: &[&Embedding]) -> Embedding {
    let mut m = vec![0.0f32; DIM];
    if vs.is_empty() {
        return m;
    }
    for v in vs {
        for (i, x) in v.iter().enumerate() {
            m[i] += x;
        }
    }
    let n = vs.len() as f32;
    for x in m.iter_mut() {
        *x /= n;
    }
    l2_norm(&m)
}

/// Pick k for n items: clamp(round(sqrt(n/2)), 2, 8)
pub fn choose_k(n: usize) -> usize {
    let k = ((n as f64 / 2.0).sqrt().round()) as usize;
    k.clamp(2, 8)
}

/// Bounded k-means over unit vectors with cosine assignment. Deterministic
/// only up to the unseeded random initialization.
pub fn kmeans(vectors: &[Embedding], k: usize) -> (Vec<usize>, Vec<Embedding>) {
    let n = vectors.len();
    if n == 0 || k <= 1 {
        let refs: Vec<&Embedding> = vectors.iter().collect();
        return (vec![0; n], vec![mean_vec(&refs)]);
    }
    let k = k.min(n);
    let mut rng = rand::rng();

    // k-means++ style seeding: first centroid uniform, the rest weighted by
    // squared cosine distance to the nearest chosen centroid
    let mut centroids: Vec<Embedding> = Vec::with_capacity(k);
    centroids.push(vectors[rng.random_range(0..n)].clone());
    while centroids.len() < k {
        let d2: Vec<f64> = vectors
            .iter()
            .map(|v| {
                let best = centroids
                    .iter()
                    .map(|c| 1.0 - cosine(v, c) as f64)
                    .fold(f64::INFINITY, f64::min);
                best * best
            })
            .collect();
        let sum: f64 = d2.iter().sum();
        let sum = if sum == 0.0 { 1.0 } else { sum };
        let mut r = rng.random::<f64>() * sum;
        let mut idx = 0;
        for (i, d) in d2.iter().enumerate() {
            r -= d;
            idx = i;
            if r <= 0.0 {
                break;
            }
        }
        centroids.push(vectors[idx.min(n - 1)].clone());
    }

    let mut labels = vec![0usize; n];
    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;

        // Assign
        for (i, v) in vectors.iter().enumerate() {
            let mut best = 0;
            let mut best_sim = f32::NEG_INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let sim = cosine(v, centroid);
                if sim > best_sim {
                    best_sim = sim;
                    best = c;
                }
            }
            if labels[i] != best {
                labels[i] = best;
                changed = true;
            }
        }

        // Update
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Embedding> = vectors
                .iter()
                .enumerate()
                .filter(|(i, _)| labels[*i] == c)
                .map(|(_, v)| v)
                .collect();
            if !members.is_empty() {
                *centroid = mean_vec(&members);
            }
        }

        if !changed {
            break;
        }
    }

    (labels, centroids)
}

/// Fallback grouping: connected components of the similarity graph at
/// `sim_threshold`, keeping components of at least `min_size` members.
pub fn density_clusters(
    vectors: &[Embedding],
    sim_threshold: f32,
    min_size: usize,
) -> Vec<Vec<usize>> {
    let n = vectors.len();
    if n == 0 {
        return Vec::new();
    }

    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if cosine(&vectors[i], &vectors[j]) >= sim_threshold {
                adj[i].push(j);
                adj[j].push(i);
            }
        }
    }

    let mut visited = vec![false; n];
    let mut clusters = Vec::new();
    for start in 0..n {
        if visited[start] {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        visited[start] = true;
        while let Some(v) = stack.pop() {
            component.push(v);
            for &nb in &adj[v] {
                if !visited[nb] {
                    visited[nb] = true;
                    stack.push(nb);
                }
            }
        }
        if component.len() >= min_size {
            clusters.push(component);
        }
    }
    clusters
}

/// Most frequent terms across `texts`, for labeling clusters
pub fn top_tokens(texts: &[&str], top_n: usize) -> Vec<String> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for tok in tokenize(text) {
            *freq.entry(tok).or_insert(0) += 1;
        }
    }
    let mut entries: Vec<(String, usize)> = freq.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.into_iter().take(top_n).map(|(w, _)| w).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_filters_short_and_long() {
        let toks = tokenize("A quick-brown FOX, it is; of 42 abc");
        assert!(toks.contains(&"quick".to_string()));
        assert!(toks.contains(&"brown".to_string()));
        assert!(toks.contains(&"abc".to_string()));
        // 1-2 char terms are dropped
        assert!(!toks.contains(&"a".to_string()));
        assert!(!toks.contains(&"it".to_string()));
        assert!(!toks.contains(&"is".to_string()));
        assert!(!toks.contains(&"of".to_string()));
        assert!(!toks.contains(&"42".to_string()));
    }

    #[test]
    fn test_embedding_is_unit_norm_and_deterministic() {
        let a = embed_text("graph neural networks", "message passing on graphs");
        let b = embed_text("graph neural networks", "message passing on graphs");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_identical_and_disjoint() {
        let a = embed_text("transformer attention mechanisms", "");
        let b = embed_text("transformer attention mechanisms", "");
        let c = embed_text("soil microbiome fertility", "");
        assert!(cosine(&a, &b) > 0.999);
        assert!(cosine(&a, &c) < 0.5);
    }

    #[test]
    fn test_choose_k_bounds() {
        for n in 6..200 {
            let k = choose_k(n);
            assert!((2..=8).contains(&k), "k out of bounds for n={}", n);
        }
        assert_eq!(choose_k(6), 2);
        assert_eq!(choose_k(128), 8);
    }

    #[test]
    fn test_kmeans_separates_obvious_groups() {
        let mut vectors = Vec::new();
        for _ in 0..5 {
            vectors.push(embed_text("deep learning neural network training", ""));
        }
        for _ in 0..5 {
            vectors.push(embed_text("marine biology coral reef ecosystems", ""));
        }
        let (labels, centroids) = kmeans(&vectors, 2);
        assert_eq!(centroids.len(), 2);
        assert_eq!(labels.len(), 10);
        // All members of each input group end up with the same label
        assert!(labels[..5].iter().all(|&l| l == labels[0]));
        assert!(labels[5..].iter().all(|&l| l == labels[5]));
        assert_ne!(labels[0], labels[5]);
    }

    #[test]
    fn test_kmeans_k_larger_than_n() {
        let vectors = vec![embed_text("one thing", ""), embed_text("another thing", "")];
        let (labels, centroids) = kmeans(&vectors, 8);
        assert_eq!(labels.len(), 2);
        assert!(centroids.len() <= 2);
    }

    #[test]
    fn test_density_clusters_respect_min_size() {
        let vectors = vec![
            embed_text("quantum error correction codes", ""),
            embed_text("quantum error correction codes", ""),
            embed_text("romanesque cathedral architecture", ""),
        ];
        let clusters = density_clusters(&vectors, 0.84, 2);
        assert_eq!(clusters.len(), 1);
        let mut members = clusters[0].clone();
        members.sort_unstable();
        assert_eq!(members, vec![0, 1]);
    }

    #[test]
    fn test_density_clusters_empty_input() {
        assert!(density_clusters(&[], 0.84, 2).is_empty());
    }

    #[test]
    fn test_top_tokens_orders_by_frequency() {
        let texts = [
            "graphene battery electrodes",
            "graphene supercapacitor electrodes",
            "graphene synthesis",
        ];
        let refs: Vec<&str> = texts.to_vec();
        let top = top_tokens(&refs, 2);
        assert_eq!(top[0], "graphene");
        assert_eq!(top[1], "electrodes");
    }
}
