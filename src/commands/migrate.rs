use std::{cmp, error::Error, process};

use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;

use crate::{
    cli::MigrateAction,
    config::Config,
    database::{migrations::Migrator, setup_database_connection},
};

pub async fn handle_migrate_command(config: &Config, action: MigrateAction) {
    // A plain connection is enough here; no background setup
    let db = setup_database_connection(&config.database).await;

    if let Err(e) = run_migration_action(&db, action).await {
        eprintln!("❌ Migration failed: {e}");
        process::exit(1);
    }
}

async fn run_migration_action(
    db: &DatabaseConnection,
    action: MigrateAction,
) -> Result<(), Box<dyn Error>> {
    match action {
        MigrateAction::Up { steps } => {
            let pending_migrations = Migrator::get_pending_migrations(db).await?;

            if pending_migrations.is_empty() {
                println!("✅ All migrations are already up to date");
                return Ok(());
            }

            let count = steps.map_or(pending_migrations.len(), |steps| {
                cmp::min(steps as usize, pending_migrations.len())
            });
            println!("Running {count} migration(s) up:");
            for migration in &pending_migrations[..count] {
                println!("  📄 {}", migration.name());
            }

            Migrator::up(db, steps).await?;
            println!("✅ Migrations completed successfully");
        }
        MigrateAction::Down { steps } => {
            let applied_migrations = Migrator::get_applied_migrations(db).await?;

            if applied_migrations.is_empty() {
                println!("❌ No migrations to roll back");
                return Ok(());
            }

            let count = cmp::min(steps as usize, applied_migrations.len());
            println!("Rolling back {count} migration(s):");
            for migration in applied_migrations[applied_migrations.len() - count..].iter().rev() {
                println!("  📄 {}", migration.name());
            }

            Migrator::down(db, Some(steps)).await?;
            println!("✅ Rollback completed successfully");
        }
        MigrateAction::Status => {
            let pending = Migrator::get_pending_migrations(db).await?;
            if pending.is_empty() {
                println!("✅ All migrations are up to date");
            } else {
                println!("📋 Pending migrations:");
                for migration in pending {
                    println!("  - {}", migration.name());
                }
            }

            let applied = Migrator::get_applied_migrations(db).await?;
            println!("📋 Applied migrations:");
            for migration in applied {
                println!("  ✓ {}", migration.name());
            }
        }
    }

    Ok(())
}
