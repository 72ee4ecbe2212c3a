use sea_orm::{ActiveEnum, DbBackend, Schema};
use sea_orm_migration::{
    prelude::*,
    schema::{integer, string, text, timestamp, uuid},
};
use sea_query::extension::postgres::Type;

use crate::database::models::message_status::MessageStatus;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let schema = Schema::new(DbBackend::Postgres);

        // Create the message_status enum
        manager
            .create_type(schema.create_enum_from_active_enum::<MessageStatus>())
            .await?;

        // Create the message table
        manager
            .create_table(
                Table::create()
                    .table(Message::Table)
                    .if_not_exists()
                    .col(
                        uuid(Message::Id)
                            .primary_key()
                            .default(Expr::cust("gen_random_uuid()")),
                    )
                    .col(
                        timestamp(Message::CreatedAt)
                            .not_null()
                            .default(Expr::cust("CURRENT_TIMESTAMP")),
                    )
                    .col(
                        timestamp(Message::UpdatedAt)
                            .not_null()
                            .default(Expr::cust("CURRENT_TIMESTAMP")),
                    )
                    .col(string(Message::Destination).not_null())
                    .col(string(Message::Subject).not_null())
                    .col(text(Message::TextBody).not_null())
                    .col(ColumnDef::new(Message::HtmlBody).text().null())
                    .col(ColumnDef::new(Message::IdempotencyKey).string().null())
                    .col(
                        ColumnDef::new(Message::Status)
                            .custom(MessageStatus::name())
                            .not_null()
                            .default("queued"),
                    )
                    .col(integer(Message::Attempts).not_null().default(0))
                    .col(integer(Message::MaxAttempts).not_null())
                    .col(
                        timestamp(Message::NextAttemptAt)
                            .not_null()
                            .default(Expr::cust("CURRENT_TIMESTAMP")),
                    )
                    .col(ColumnDef::new(Message::ClaimedAt).timestamp().null())
                    .col(ColumnDef::new(Message::ClaimedBy).string().null())
                    .col(ColumnDef::new(Message::LastError).text().null())
                    .col(ColumnDef::new(Message::ProviderMessageId).string().null())
                    .to_owned(),
            )
            .await?;

        // The claim query filters on status and orders by eligibility time
        manager
            .create_index(
                Index::create()
                    .name("idx-message-status-next_attempt_at")
                    .table(Message::Table)
                    .col(Message::Status)
                    .col(Message::NextAttemptAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-message-idempotency_key")
                    .table(Message::Table)
                    .col(Message::IdempotencyKey)
                    .to_owned(),
            )
            .await?;

        // Create the updated_at trigger for the message table
        manager
            .get_connection()
            .execute_unprepared(
                r"
                CREATE TRIGGER update_message_updated_at
                    BEFORE UPDATE ON message
                    FOR EACH ROW
                    EXECUTE FUNCTION touch_updated_at();
                ",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop the trigger first
        manager
            .get_connection()
            .execute_unprepared("DROP TRIGGER IF EXISTS update_message_updated_at ON message;")
            .await?;

        manager
            .drop_table(Table::drop().table(Message::Table).to_owned())
            .await?;

        manager
            .drop_type(Type::drop().name(MessageStatus::name()).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Message {
    Table,
    Id,
    CreatedAt,
    UpdatedAt,
    Destination,
    Subject,
    TextBody,
    HtmlBody,
    IdempotencyKey,
    Status,
    Attempts,
    MaxAttempts,
    NextAttemptAt,
    ClaimedAt,
    ClaimedBy,
    LastError,
    ProviderMessageId,
}
