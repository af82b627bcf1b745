//! Stripe customer management

use stripe::{CreateCustomer, Customer, ListCustomers, Metadata, UpdateCustomer};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Metadata written onto every Stripe customer we own
pub(crate) fn account_metadata(account_id: Uuid) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("account_id".to_string(), account_id.to_string());
    metadata.insert("platform".to_string(), "shiftwise".to_string());
    metadata
}

/// Customer service for managing Stripe customers
#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeClient,
}

impl CustomerService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Find the Stripe customer for an account by email, or create one.
    ///
    /// Lookup is an exact-email match and the first result wins. Best effort:
    /// an account whose email changed in Stripe gets a fresh customer, and the
    /// completed-session webhook still resolves the account through metadata.
    /// Reused customers get their metadata refreshed so `account_id` is
    /// present for webhook resolution.
    pub async fn find_or_create(&self, account_id: Uuid, email: &str) -> BillingResult<Customer> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);

        let existing = Customer::list(self.stripe.inner(), &params).await?;

        if let Some(customer) = existing.data.into_iter().next() {
            tracing::info!(
                account_id = %account_id,
                customer_id = %customer.id,
                "Reusing existing Stripe customer"
            );

            let update = UpdateCustomer {
                metadata: Some(account_metadata(account_id)),
                ..Default::default()
            };
            let customer = Customer::update(self.stripe.inner(), &customer.id, update).await?;
            return Ok(customer);
        }

        let params = CreateCustomer {
            email: Some(email),
            metadata: Some(account_metadata(account_id)),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer)
    }
}

/// Read the owning account id out of customer metadata
pub(crate) fn account_id_from_metadata(metadata: Option<&Metadata>) -> Option<Uuid> {
    metadata
        .and_then(|m| m.get("account_id"))
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_metadata_carries_account_id() {
        let account_id = Uuid::new_v4();
        let metadata = account_metadata(account_id);
        assert_eq!(metadata.get("account_id"), Some(&account_id.to_string()));
        assert_eq!(metadata.get("platform"), Some(&"shiftwise".to_string()));
    }

    #[test]
    fn test_account_id_from_metadata() {
        let account_id = Uuid::new_v4();
        let metadata = account_metadata(account_id);
        assert_eq!(account_id_from_metadata(Some(&metadata)), Some(account_id));
    }

    #[test]
    fn test_account_id_missing_or_malformed() {
        assert_eq!(account_id_from_metadata(None), None);

        let mut metadata = Metadata::new();
        metadata.insert("account_id".to_string(), "not-a-uuid".to_string());
        assert_eq!(account_id_from_metadata(Some(&metadata)), None);
    }
}
