use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Wake idle workers as soon as a message is enqueued; polling
        // remains the fallback when no listener is connected.
        manager
            .get_connection()
            .execute_unprepared(
                r"
                CREATE OR REPLACE FUNCTION notify_message_queued()
                RETURNS TRIGGER AS $$
                BEGIN
                    PERFORM pg_notify('message_queued', NEW.id::text);
                    RETURN NEW;
                END;
                $$ language 'plpgsql';

                CREATE TRIGGER message_queued_notify
                    AFTER INSERT ON message
                    FOR EACH ROW
                    EXECUTE FUNCTION notify_message_queued();
                ",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(
                r"
                DROP TRIGGER IF EXISTS message_queued_notify ON message;
                DROP FUNCTION IF EXISTS notify_message_queued();
                ",
            )
            .await?;

        Ok(())
    }
}
