//! Creates the `calendar_connections` table.
//!
//! One row binds a principal to one external calendar account, holding the
//! encrypted OAuth credentials, the push-notification channel and sync bookkeeping.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CalendarConnections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CalendarConnections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CalendarConnections::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(CalendarConnections::PrincipalId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CalendarConnections::Provider).text().not_null())
                    .col(
                        ColumnDef::new(CalendarConnections::CalendarId)
                            .text()
                            .not_null()
                            .default("primary"),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::AccessTokenCiphertext)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::RefreshTokenCiphertext)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::WebhookChannelId)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::WebhookResourceId)
                            .text()
                            .null(),
                    )
                    .col(ColumnDef::new(CalendarConnections::WebhookToken).text().null())
                    .col(
                        ColumnDef::new(CalendarConnections::WebhookExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::SyncRangeStartDays)
                            .integer()
                            .not_null()
                            .default(-7),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::SyncRangeEndDays)
                            .integer()
                            .not_null()
                            .default(28),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(CalendarConnections::LastError).text().null())
                    .col(
                        ColumnDef::new(CalendarConnections::Status)
                            .text()
                            .not_null()
                            .default("active"),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CalendarConnections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // At most one connection per principal and provider inside a tenant.
        manager
            .create_index(
                Index::create()
                    .name("idx_calendar_connections_tenant_principal_provider")
                    .table(CalendarConnections::Table)
                    .col(CalendarConnections::TenantId)
                    .col(CalendarConnections::PrincipalId)
                    .col(CalendarConnections::Provider)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_calendar_connections_webhook_channel")
                    .table(CalendarConnections::Table)
                    .col(CalendarConnections::WebhookChannelId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_calendar_connections_webhook_channel")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_calendar_connections_tenant_principal_provider")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(CalendarConnections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CalendarConnections {
    Table,
    Id,
    TenantId,
    PrincipalId,
    Provider,
    CalendarId,
    AccessTokenCiphertext,
    RefreshTokenCiphertext,
    TokenExpiresAt,
    WebhookChannelId,
    WebhookResourceId,
    WebhookToken,
    WebhookExpiresAt,
    SyncRangeStartDays,
    SyncRangeEndDays,
    LastSyncedAt,
    LastError,
    Status,
    CreatedAt,
    UpdatedAt,
}
