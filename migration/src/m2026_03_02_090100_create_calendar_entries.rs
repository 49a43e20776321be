//! Creates the `calendar_entries` table holding internal scheduling records,
//! both natively authored and materialized from external calendar events.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CalendarEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CalendarEntries::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CalendarEntries::TenantId).uuid().not_null())
                    .col(ColumnDef::new(CalendarEntries::AuthorId).uuid().not_null())
                    .col(ColumnDef::new(CalendarEntries::Title).text().not_null())
                    .col(ColumnDef::new(CalendarEntries::Description).text().null())
                    .col(
                        ColumnDef::new(CalendarEntries::StartAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CalendarEntries::EndAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CalendarEntries::AllDay)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(CalendarEntries::Origin)
                            .text()
                            .not_null()
                            .default("internal"),
                    )
                    .col(ColumnDef::new(CalendarEntries::ExternalProvider).text().null())
                    .col(ColumnDef::new(CalendarEntries::ExternalId).text().null())
                    .col(
                        ColumnDef::new(CalendarEntries::ExternalUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CalendarEntries::DeletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CalendarEntries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CalendarEntries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // External ids are unique per tenant and provider; NULLs (never synced) do not collide.
        manager
            .create_index(
                Index::create()
                    .name("idx_calendar_entries_tenant_external")
                    .table(CalendarEntries::Table)
                    .col(CalendarEntries::TenantId)
                    .col(CalendarEntries::ExternalProvider)
                    .col(CalendarEntries::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_calendar_entries_tenant_author_origin")
                    .table(CalendarEntries::Table)
                    .col(CalendarEntries::TenantId)
                    .col(CalendarEntries::AuthorId)
                    .col(CalendarEntries::Origin)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_calendar_entries_tenant_author_origin")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_calendar_entries_tenant_external")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(CalendarEntries::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CalendarEntries {
    Table,
    Id,
    TenantId,
    AuthorId,
    Title,
    Description,
    StartAt,
    EndAt,
    AllDay,
    Origin,
    ExternalProvider,
    ExternalId,
    ExternalUpdatedAt,
    DeletedAt,
    CreatedAt,
    UpdatedAt,
}
