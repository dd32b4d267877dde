//! Account discovery over the rate-limited request pipeline.
//!
//! Every call here is submitted to the [`Orchestrator`], so discovery spends
//! quota like any other caller.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::executor::{ApiOperation, ApiRequest};
use crate::orchestrator::Orchestrator;
use crate::store::CredentialStore;

const CUSTOMER_QUERY: &str = "SELECT customer.id, customer.descriptive_name, customer.currency_code, \
     customer.time_zone, customer.manager FROM customer LIMIT 1";

const CHILD_ACCOUNTS_QUERY: &str = "SELECT customer_client.id, customer_client.descriptive_name, \
     customer_client.currency_code, customer_client.time_zone, customer_client.manager, \
     customer_client.level FROM customer_client WHERE customer_client.level = 1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredAccount {
    pub id: String,
    pub name: Option<String>,
    pub currency: Option<String>,
    pub timezone: Option<String>,
    pub is_manager: bool,
    pub parent_manager_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountHierarchy {
    pub manager: DiscoveredAccount,
    pub children: Vec<DiscoveredAccount>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListAccessibleResponse {
    #[serde(default)]
    resource_names: Vec<String>,
}

#[derive(Deserialize)]
struct SearchResponse<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Deserialize)]
struct CustomerRow {
    customer: CustomerFields,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerClientRow {
    customer_client: CustomerFields,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerFields {
    id: AccountId,
    descriptive_name: Option<String>,
    currency_code: Option<String>,
    time_zone: Option<String>,
    #[serde(default)]
    manager: bool,
}

// int64 fields arrive as JSON strings, but tolerate plain numbers too.
#[derive(Deserialize)]
#[serde(untagged)]
enum AccountId {
    Text(String),
    Number(u64),
}

impl AccountId {
    fn into_string(self) -> String {
        match self {
            AccountId::Text(s) => s,
            AccountId::Number(n) => n.to_string(),
        }
    }
}

impl CustomerFields {
    fn into_account(self, parent_manager_id: Option<String>) -> DiscoveredAccount {
        DiscoveredAccount {
            id: self.id.into_string(),
            name: self.descriptive_name,
            currency: self.currency_code,
            timezone: self.time_zone,
            is_manager: self.manager,
            parent_manager_id,
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(|e| GatewayError::PermanentApi {
        status: 200,
        message: format!("unexpected {what} response: {e}"),
    })
}

pub struct AccountDiscovery {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn CredentialStore>,
    platform: String,
}

impl AccountDiscovery {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn CredentialStore>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            platform: platform.into(),
        }
    }

    /// Customer ids the owner's credential can reach directly.
    pub async fn list_accessible_accounts(&self, owner_id: &str) -> Result<Vec<String>, GatewayError> {
        let request = ApiRequest::new(owner_id, ApiOperation::get("customers:listAccessibleCustomers"));
        let response: ListAccessibleResponse =
            parse(self.orchestrator.execute(request).await?, "listAccessibleCustomers")?;

        Ok(response
            .resource_names
            .into_iter()
            .map(|name| match name.strip_prefix("customers/") {
                Some(id) => id.to_string(),
                None => name,
            })
            .collect())
    }

    pub async fn get_account_details(
        &self,
        owner_id: &str,
        account_id: &str,
    ) -> Result<DiscoveredAccount, GatewayError> {
        let request = ApiRequest::new(owner_id, ApiOperation::search(account_id, CUSTOMER_QUERY))
            .for_account(account_id);
        let response: SearchResponse<CustomerRow> =
            parse(self.orchestrator.execute(request).await?, "customer")?;

        response
            .results
            .into_iter()
            .next()
            .map(|row| row.customer.into_account(None))
            .ok_or_else(|| GatewayError::NotFound(format!("customer {account_id}")))
    }

    /// Pick the manager account and persist it as the owner's orchestration root.
    ///
    /// Falls back to the first accessible account (with a warning) when none
    /// is flagged as a manager.
    pub async fn discover_manager_account(&self, owner_id: &str) -> Result<String, GatewayError> {
        let (manager_id, _) = self.locate_manager(owner_id).await?;
        Ok(manager_id)
    }

    /// Manager account plus its direct children.
    pub async fn discover_hierarchy(&self, owner_id: &str) -> Result<AccountHierarchy, GatewayError> {
        let (manager_id, details) = self.locate_manager(owner_id).await?;
        let manager = match details {
            Some(details) => details,
            None => self.get_account_details(owner_id, &manager_id).await?,
        };

        if !manager.is_manager {
            return Ok(AccountHierarchy {
                manager,
                children: Vec::new(),
            });
        }

        let request = ApiRequest::new(owner_id, ApiOperation::search(&manager_id, CHILD_ACCOUNTS_QUERY))
            .for_account(&manager_id)
            .acting_as(&manager_id);
        let response: SearchResponse<CustomerClientRow> =
            parse(self.orchestrator.execute(request).await?, "customer_client")?;

        let children = response
            .results
            .into_iter()
            .map(|row| row.customer_client.into_account(Some(manager_id.clone())))
            .filter(|child| child.id != manager_id)
            .collect();

        Ok(AccountHierarchy { manager, children })
    }

    /// Persisted root id, with its details when they could be fetched.
    async fn locate_manager(
        &self,
        owner_id: &str,
    ) -> Result<(String, Option<DiscoveredAccount>), GatewayError> {
        let accessible = self.list_accessible_accounts(owner_id).await?;
        let Some(first_id) = accessible.first().cloned() else {
            return Err(GatewayError::NotFound(format!(
                "no accessible accounts for {owner_id}"
            )));
        };

        let mut manager = None;
        let mut first_described = None;
        for account_id in &accessible {
            let details = match self.get_account_details(owner_id, account_id).await {
                Ok(details) => details,
                // Disabled or cancelled customers still show up as accessible.
                Err(GatewayError::PermanentApi { status, message }) => {
                    warn!(owner_id, account_id = %account_id, status, "Skipping account that cannot be queried: {message}");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if details.is_manager {
                manager = Some(details);
                break;
            }
            if first_described.is_none() {
                first_described = Some(details);
            }
        }

        let (manager_id, details) = match manager {
            Some(details) => {
                info!(owner_id, manager_id = %details.id, "Manager account discovered");
                (details.id.clone(), Some(details))
            }
            None => {
                let fallback = first_described.as_ref().map_or(first_id, |d| d.id.clone());
                warn!(
                    owner_id,
                    fallback = %fallback,
                    accessible = accessible.len(),
                    "No manager account among accessible accounts, falling back to first"
                );
                (fallback, first_described)
            }
        };

        self.store
            .set_manager_account(&self.platform, owner_id, &manager_id)
            .await?;

        Ok((manager_id, details))
    }
}
