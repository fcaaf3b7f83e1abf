use rocket_db_pools::{sqlx, Database};

#[derive(Database)]
#[database("mailbridge_db")]
pub struct MailDb(sqlx::PgPool);

pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
