pub use sea_orm_migration::prelude::*;

mod m20260801_100000_create_updated_at_trigger;
mod m20260801_100500_create_message;
mod m20260801_101000_create_message_notify;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260801_100000_create_updated_at_trigger::Migration),
            Box::new(m20260801_100500_create_message::Migration),
            Box::new(m20260801_101000_create_message_notify::Migration),
        ]
    }
}

pub struct Migrator;
