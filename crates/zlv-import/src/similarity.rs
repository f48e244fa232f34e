use sha2::{Digest, Sha256};
use strsim::jaro_winkler;
use zlv_core::{address_tokens, normalize_text, postal_code, surname, OwnerIdentity, OwnerRecord};

use crate::config::SimilarityWeights;

/// Hex characters kept from the blocking-key digest.
const BLOCKING_KEY_LEN: usize = 16;

/// Bucket key: digest of surname and postal code, or the external id when
/// either is missing. `None` means the record cannot be bucketed.
pub fn blocking_key(record: &OwnerRecord) -> Option<String> {
    match (surname(&record.full_name), postal_code(&record.raw_address)) {
        (Some(surname), Some(postal)) => {
            let digest = hex::encode(Sha256::digest(format!("{surname}|{postal}").as_bytes()));
            Some(digest[..BLOCKING_KEY_LEN].to_string())
        }
        _ => record.idpersonne.as_ref().map(|id| format!("id:{id}")),
    }
}

/// Scores how likely an incoming record and a persisted owner are the same
/// person, in `[0, 1]`.
pub trait SimilarityPolicy: Send + Sync {
    fn score(&self, incoming: &OwnerRecord, candidate: &OwnerIdentity) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedSimilarity {
    weights: SimilarityWeights,
}

impl WeightedSimilarity {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self { weights }
    }
}

impl SimilarityPolicy for WeightedSimilarity {
    fn score(&self, incoming: &OwnerRecord, candidate: &OwnerIdentity) -> f64 {
        if let (Some(a), Some(b)) = (&incoming.idpersonne, &candidate.idpersonne) {
            if a != b {
                return 0.0;
            }
        }
        let birth = match (incoming.birth_date, candidate.birth_date) {
            (Some(a), Some(b)) if a != b => return 0.0,
            (Some(_), Some(_)) => Some(1.0),
            _ => None,
        };

        let name_a = normalize_text(&incoming.full_name);
        let name_b = normalize_text(&candidate.full_name);
        let name = (!name_a.is_empty() && !name_b.is_empty()).then(|| jaro_winkler(&name_a, &name_b));

        let tokens_a = address_tokens(&incoming.raw_address);
        let tokens_b = address_tokens(&candidate.raw_address);
        let address = (!tokens_a.is_empty() && !tokens_b.is_empty()).then(|| {
            let shared = tokens_a.intersection(&tokens_b).count() as f64;
            let total = tokens_a.union(&tokens_b).count() as f64;
            shared / total
        });

        let components = [
            (self.weights.name, name),
            (self.weights.address, address),
            (self.weights.birth_date, birth),
        ];
        let (weighted, weight) = components
            .iter()
            .filter_map(|(w, s)| s.map(|s| (w * s, *w)))
            .fold((0.0, 0.0), |(acc_s, acc_w), (s, w)| (acc_s + s, acc_w + w));
        if weight <= 0.0 {
            0.0
        } else {
            (weighted / weight).clamp(0.0, 1.0)
        }
    }
}
