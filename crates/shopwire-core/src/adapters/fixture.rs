use crate::data_source::{DetailsRequest, ProductSource, SearchRequest, SourceError, SourceFuture};
use crate::{ProductRecord, ProviderId, ValidationError};

const CATALOGUE: [(&str, &str, f64); 8] = [
    ("kettle-1700", "Electric Kettle 1.7L", 29.0),
    ("kettle-gooseneck", "Gooseneck Pour-Over Kettle", 54.0),
    ("espresso-duo", "Dual Boiler Espresso Machine", 899.0),
    ("grinder-burr", "Conical Burr Coffee Grinder", 119.0),
    ("toaster-4", "Four Slice Toaster", 64.0),
    ("blender-pro", "High Speed Blender", 179.0),
    ("airfryer-xl", "XL Air Fryer", 139.0),
    ("scale-kitchen", "Digital Kitchen Scale", 19.0),
];

fn provider_seed(provider: &ProviderId) -> u64 {
    provider
        .as_str()
        .bytes()
        .fold(17_u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)))
}

fn catalogue_record(
    source: &ProviderId,
    seed: u64,
    (product_id, name, base_price): &(&str, &str, f64),
) -> Result<ProductRecord, ValidationError> {
    let offset = (seed.wrapping_mul(7) % 21) as f64 / 10.0;
    let in_stock = seed % 5 != 0;

    Ok(ProductRecord::new(source.clone(), *product_id, *name)?
        .with_price(base_price + offset, "USD")?
        .with_stock(in_stock)
        .with_url(format!("https://{}.example/products/{product_id}", source.as_str())))
}

/// Offline adapter answering from a fixed kitchenware catalogue.
///
/// Prices and stock vary per provider name but are stable across runs.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    id: ProviderId,
    products: Vec<ProductRecord>,
}

impl FixtureSource {
    pub fn new(id: ProviderId) -> Result<Self, ValidationError> {
        let seed = provider_seed(&id);
        let products = CATALOGUE
            .iter()
            .enumerate()
            .map(|(index, entry)| catalogue_record(&id, seed.wrapping_add(index as u64), entry))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { id, products })
    }

    pub fn products(&self) -> &[ProductRecord] {
        &self.products
    }
}

impl ProductSource for FixtureSource {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn search<'a>(&'a self, req: SearchRequest) -> SourceFuture<'a, Vec<ProductRecord>> {
        Box::pin(async move {
            let query = req.normalized_query();
            let terms = query.split(' ').collect::<Vec<_>>();
            Ok(self
                .products
                .iter()
                .filter(|product| {
                    let name = product.name.to_lowercase();
                    terms.iter().all(|term| name.contains(term))
                })
                .cloned()
                .collect())
        })
    }

    fn details<'a>(&'a self, req: DetailsRequest) -> SourceFuture<'a, ProductRecord> {
        Box::pin(async move {
            self.products
                .iter()
                .find(|product| product.id == req.id.trim())
                .cloned()
                .ok_or_else(|| {
                    SourceError::provider_status(404, format!("product '{}' not found", req.id))
                        .with_provider(self.id.clone())
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceErrorKind;

    fn fixture(name: &str) -> FixtureSource {
        FixtureSource::new(ProviderId::parse(name).expect("valid provider"))
            .expect("catalogue is valid")
    }

    #[tokio::test]
    async fn search_matches_every_term_case_insensitively() {
        let records = fixture("shopapi")
            .search(SearchRequest::new("KETTLE pour").expect("valid"))
            .await
            .expect("search succeeds");

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "kettle-gooseneck");
    }

    #[tokio::test]
    async fn prices_are_stable_per_provider() {
        let first = fixture("shopapi");
        let again = fixture("shopapi");
        assert_eq!(first.products(), again.products());
        assert!(first.products().iter().all(|product| product.price.is_some()));
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let error = fixture("shopapi")
            .details(DetailsRequest::new("missing").expect("valid"))
            .await
            .expect_err("not in catalogue");
        assert_eq!(error.kind(), SourceErrorKind::ProviderError(404));
        assert!(!error.retryable());
    }
}
