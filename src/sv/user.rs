use crate::{entity::user, prelude::*};

pub struct User<'a, C = DatabaseConnection> {
  db: &'a C,
}

impl<'a, C: ConnectionTrait> User<'a, C> {
  pub fn new(db: &'a C) -> Self {
    Self { db }
  }

  pub async fn by_customer(
    &self,
    customer_id: &str,
  ) -> Result<Option<user::Model>> {
    let user = user::Entity::find()
      .filter(user::Column::CustomerId.eq(customer_id))
      .one(self.db)
      .await?;
    Ok(user)
  }

  /// Insert-or-read keyed by the billing customer id. A racing insert from a
  /// concurrent delivery surfaces as a unique violation and is re-read.
  pub async fn get_or_create(
    &self,
    customer_id: &str,
    email: &str,
  ) -> Result<user::Model> {
    if let Some(user) = self.by_customer(customer_id).await? {
      return Ok(user);
    }

    let user = user::ActiveModel {
      email: Set(email.to_string()),
      customer_id: Set(Some(customer_id.to_string())),
      created_at: Set(utils::now()),
      ..Default::default()
    };

    match user.insert(self.db).await {
      Ok(user) => {
        info!(customer_id, "User created");
        Ok(user)
      }
      Err(err) if utils::is_unique_violation(&err) => self
        .by_customer(customer_id)
        .await?
        .ok_or_else(|| Error::Internal(format!("user {customer_id} vanished"))),
      Err(err) => Err(err.into()),
    }
  }
}
